//! Discovery: slaves appear within an announce interval and expire when
//! they fall silent.

use std::time::{Duration, Instant};

use cascade_net::SlaveStatus;

use crate::common::{Stack, spawn_slave};

#[tokio::test]
async fn slaves_appear_within_the_announce_interval() {
    let stack = Stack::start(0, 2).await;

    let started = Instant::now();
    let slave = spawn_slave(2, stack.discovery_addr, &stack.config).await;
    stack.await_slaves(1).await;

    // Generous bound: one announce interval plus scheduling noise.
    assert!(started.elapsed() < stack.config.announce_interval * 10);
    assert!(
        stack
            .registry
            .entry(slave.endpoint())
            .is_some_and(|e| e.status == SlaveStatus::Idle)
    );

    slave.shutdown().await;
    stack.shutdown().await;
}

#[tokio::test]
async fn silent_slaves_expire_and_revive() {
    let stack = Stack::start(1, 2).await;
    let endpoint = stack.slaves[0].endpoint();
    assert_eq!(stack.registry.live_count(), 1);

    // Shut the slave down; its announcements stop and the registry
    // expires it after the liveness timeout.
    let mut stack = stack;
    let slave = stack.slaves.remove(0);
    slave.shutdown().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while stack.registry.live_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("silent slave never expired");
    assert_eq!(
        stack.registry.entry(endpoint).unwrap().status,
        SlaveStatus::Disconnected
    );

    // A replacement announcing on the same discovery socket goes live.
    let replacement = spawn_slave(2, stack.discovery_addr, &stack.config).await;
    stack.await_slaves(1).await;

    replacement.shutdown().await;
    stack.shutdown().await;
}
