//! Cancellation: explicit, and implicit via client disconnect.

use std::time::Duration;

use cascade_core::CancelToken;
use cascade_net::Client;

use crate::common::{Stack, sir_unit};

#[tokio::test]
async fn client_cancel_yields_partial_result() {
    let stack = Stack::start(1, 1).await;
    let mut client = Client::connect(stack.master, None, &stack.config)
        .await
        .unwrap();

    let replications = 200_000;
    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        canceller.cancel();
    });

    let result = client
        .submit_cancellable(&sir_unit(100.0, 20), replications, 5, &cancel)
        .await
        .unwrap();

    // The campaign stops at a batch boundary; whatever ran is reported.
    assert!(result.completed < replications);
    assert_eq!(result.failed, 0);

    stack.shutdown().await;
}

#[tokio::test]
async fn client_disconnect_cancels_the_campaign() {
    let stack = Stack::start(1, 1).await;
    let config = stack.config.clone();
    let master = stack.master;

    let submission = tokio::spawn(async move {
        let mut client = Client::connect(master, None, &config).await.unwrap();
        // Never finishes inside the test window.
        let _ = client.submit(&sir_unit(100.0, 20), 200_000, 5).await;
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while stack.coordinator.running_campaigns() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("campaign never started");

    // Dropping the connection mid-campaign takes the campaign with it.
    submission.abort();
    tokio::time::timeout(Duration::from_secs(5), async {
        while stack.coordinator.running_campaigns() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("campaign kept running after its client vanished");

    stack.shutdown().await;
}
