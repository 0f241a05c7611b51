//! End-to-end campaigns across discovered slaves.

use cascade_core::{SimulationManager, SimulationMonitor};
use cascade_net::Client;

use crate::common::{Stack, sir_unit};

#[tokio::test]
async fn campaign_completes_over_discovered_slaves() {
    let stack = Stack::start(3, 2).await;
    let mut client = Client::connect(stack.master, None, &stack.config)
        .await
        .unwrap();

    let unit = sir_unit(30.0, 20);
    let result = client.submit(&unit, 60, 7).await.unwrap();

    assert_eq!(result.completed, 60);
    assert_eq!(result.failed, 0);
    assert!(result.error.is_none());
    // Every grid point aggregates every replication.
    for point in result.samples.samplings()[0].points() {
        assert_eq!(point.count(), 60);
    }

    stack.shutdown().await;
}

#[tokio::test]
async fn distributed_results_match_local_execution() {
    let replications = 40;
    let seed = 1234;
    let unit = sir_unit(30.0, 20);

    let (monitor, _) = SimulationMonitor::new(replications);
    let local = SimulationManager::sequential()
        .run(unit.clone(), replications, seed, &monitor)
        .await
        .unwrap();

    let stack = Stack::start(2, 2).await;
    let mut client = Client::connect(stack.master, None, &stack.config)
        .await
        .unwrap();
    let remote = client.submit(&unit, replications, seed).await.unwrap();

    assert_eq!(remote.completed, local.completed);
    let a = local.samples.samplings()[0].time_series();
    let b = remote.samples.samplings()[0].time_series();
    for ((_, mean_a, std_a), (_, mean_b, std_b)) in a.iter().zip(b.iter()) {
        assert!((mean_a - mean_b).abs() < 1e-9);
        assert!((std_a - std_b).abs() < 1e-9);
    }

    stack.shutdown().await;
}

#[tokio::test]
async fn repeated_submissions_are_deterministic() {
    let stack = Stack::start(2, 2).await;
    let mut client = Client::connect(stack.master, None, &stack.config)
        .await
        .unwrap();

    let unit = sir_unit(20.0, 10);
    // The second submission reuses the model already distributed to the
    // master and slaves; same seed, same statistics.
    let first = client.submit(&unit, 25, 3).await.unwrap();
    let second = client.submit(&unit, 25, 3).await.unwrap();

    assert_eq!(first.completed, 25);
    assert_eq!(second.completed, 25);
    assert_eq!(
        first.samples.samplings()[0].time_series(),
        second.samples.samplings()[0].time_series()
    );

    stack.shutdown().await;
}
