//! Cluster-level election scenarios over the simulated network.

use anyhow::{ensure, Context};
use herald_core::{ElectionConfig, Epoch, NodeId};
use herald_testing::{
    init_test_logging, until_pass, NetworkConditions, SimNetwork, TestCluster,
};
use std::time::Duration;
use tokio::time::Instant;

const ELECTION_TIMEOUT: Duration = Duration::from_millis(400);

/// Longest single election timer draw, `[ET, 2ET)`.
const ELECTION_WINDOW: Duration = Duration::from_millis(800);

const POLL: Duration = Duration::from_millis(50);

fn config() -> ElectionConfig {
    ElectionConfig::new()
        .with_network_timeout(Duration::from_millis(50))
        .with_heartbeat_timeout(Duration::from_millis(100))
        .with_leader_quorum_timeout(Duration::from_millis(300))
        .with_election_timeout(ELECTION_TIMEOUT)
}

fn id(name: &str) -> NodeId {
    NodeId::from(name)
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Polls `check` until it passes and fails if that takes longer than `bound`.
async fn settles_within<F>(bound: Duration, check: F) -> anyhow::Result<Duration>
where
    F: FnMut() -> anyhow::Result<()>,
{
    let started = Instant::now();
    let attempts = (bound.as_millis() / POLL.as_millis()) as usize + 2;
    until_pass(attempts, POLL, check).await?;
    let elapsed = started.elapsed();
    ensure!(
        elapsed <= bound + POLL * 2,
        "settled after {:?}, expected at most {:?}",
        elapsed,
        bound
    );
    Ok(elapsed)
}

fn elections_started(cluster: &TestCluster) -> u64 {
    cluster
        .nodes()
        .map(|(_, node)| node.stats().elections_started)
        .sum()
}

/// Starts n0 alone, waits for it to lead, then adds n1..n4 as followers.
async fn create_cluster(cluster: &mut TestCluster) -> anyhow::Result<()> {
    create_cluster_of(cluster, &["n0", "n1", "n2", "n3", "n4"]).await
}

/// Starts the first name alone, waits for it to lead, then adds the rest.
async fn create_cluster_of(cluster: &mut TestCluster, names: &[&str]) -> anyhow::Result<()> {
    let (first, rest) = names.split_first().context("no nodes to start")?;
    let leader = id(first);
    cluster.spawn_node(*first, config()).await?;
    until_pass(20, ms(50), || {
        let status = cluster.status();
        ensure!(status.get(&leader) == Some(&Some(leader.clone())), "{} not leading: {:?}", leader, status);
        Ok(())
    })
    .await?;

    for name in rest {
        cluster.spawn_node(*name, config()).await?;
    }

    until_pass(50, ms(100), || {
        let status = cluster.status();
        ensure!(status.len() == names.len());
        ensure!(
            status.values().all(|view| view.as_ref() == Some(&leader)),
            "cluster has not converged on {}: {:?}",
            leader,
            status
        );
        Ok(())
    })
    .await
}

/// Test that a single node elects itself
#[tokio::test]
async fn test_lone_node_leads_epoch_one() {
    init_test_logging();
    let mut cluster = TestCluster::new();
    let node = cluster.spawn_node("solo", config()).await.unwrap();

    assert!(node.is_leader());
    assert_eq!(node.epoch(), Epoch::new(1));
    assert_eq!(node.leader(), Some(id("solo")));
    cluster.close().await;
}

/// Test that followers joining a running leader converge on it
#[tokio::test]
async fn test_cluster_converges_on_single_leader() {
    init_test_logging();
    let mut cluster = TestCluster::new();
    create_cluster(&mut cluster).await.unwrap();

    assert_eq!(cluster.leaders(), vec![id("n0")]);
    for (node_id, node) in cluster.nodes() {
        assert_eq!(node.status().quorum_size, 3, "{} has the wrong quorum", node_id);
    }

    // the leader stays put while nothing goes wrong
    tokio::time::sleep(ELECTION_TIMEOUT * 3).await;
    assert_eq!(cluster.leaders(), vec![id("n0")]);
    assert_eq!(cluster.node("n0").unwrap().stats().step_downs, 0);
    cluster.close().await;
}

/// Test that resigning hands leadership to a different node
#[tokio::test]
async fn test_resign_hands_over_leadership() {
    init_test_logging();
    let mut cluster = TestCluster::new();
    create_cluster(&mut cluster).await.unwrap();

    let n0 = cluster.node("n0").unwrap().clone();
    n0.resign().await.unwrap();
    assert!(!n0.is_leader());

    // two election windows, each drawn from [ET, 2ET)
    settles_within(ELECTION_WINDOW * 2, || {
        let leaders = cluster.leaders();
        ensure!(leaders.len() == 1, "leaders: {:?}", leaders);
        ensure!(leaders[0] != id("n0"), "n0 leads again");
        Ok(())
    })
    .await
    .unwrap();
    assert!(!n0.is_leader());

    let new_leader = cluster.leaders()[0].clone();
    settles_within(ELECTION_WINDOW, || {
        let status = cluster.status();
        ensure!(
            status.values().all(|leader| leader.as_ref() == Some(&new_leader)),
            "not everyone follows {}: {:?}",
            new_leader,
            status
        );
        Ok(())
    })
    .await
    .unwrap();
    cluster.close().await;
}

/// Test that a disconnected follower loses the leader and rejoins without a new election
#[tokio::test]
async fn test_follower_disconnect_and_rejoin() {
    init_test_logging();
    let mut cluster = TestCluster::new();
    create_cluster(&mut cluster).await.unwrap();

    let elections_before =
        elections_started(&cluster) - cluster.node("n4").unwrap().stats().elections_started;

    cluster.add_network_error("n4");
    settles_within(ELECTION_WINDOW, || {
        let status = cluster.status();
        ensure!(status[&id("n4")] != Some(id("n0")), "n4 still follows n0");
        Ok(())
    })
    .await
    .unwrap();

    // the rest of the cluster keeps its leader
    assert_eq!(cluster.leaders(), vec![id("n0")]);

    cluster.del_network_error("n4");
    settles_within(ELECTION_WINDOW, || {
        let status = cluster.status();
        ensure!(status[&id("n4")] == Some(id("n0")), "n4 follows {:?}", status[&id("n4")]);
        Ok(())
    })
    .await
    .unwrap();

    let n0 = cluster.node("n0").unwrap();
    assert!(n0.is_leader());
    assert_eq!(n0.stats().step_downs, 0);

    // only n4 campaigned
    let elections_after =
        elections_started(&cluster) - cluster.node("n4").unwrap().stats().elections_started;
    assert_eq!(elections_before, elections_after);
    cluster.close().await;
}

/// Test that an isolated leader demotes itself and the rest elect a replacement
#[tokio::test]
async fn test_leader_disconnect() {
    init_test_logging();
    let mut cluster = TestCluster::new();
    create_cluster(&mut cluster).await.unwrap();

    cluster.add_network_error("n0");
    until_pass(30, ms(100), || {
        let n0 = cluster.node("n0").unwrap();
        ensure!(n0.leader() != Some(id("n0")), "n0 still believes it leads");
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(cluster.node("n0").unwrap().stats().quorum_losses, 1);

    until_pass(40, ms(100), || {
        let leaders = cluster.leaders();
        ensure!(leaders.len() == 1, "leaders: {:?}", leaders);
        let leader = &leaders[0];
        ensure!(leader != &id("n0"));
        let status = cluster.status();
        ensure!(status
            .iter()
            .filter(|(node_id, _)| *node_id != &id("n0"))
            .all(|(_, view)| view.as_ref() == Some(leader)));
        Ok(())
    })
    .await
    .unwrap();

    // once reconnected, n0 follows the new leader
    cluster.del_network_error("n0");
    until_pass(40, ms(100), || {
        let status = cluster.status();
        let first = status.values().next().cloned().flatten();
        ensure!(first.is_some());
        ensure!(status.values().all(|view| view == &first), "views differ: {:?}", status);
        ensure!(cluster.leaders().len() == 1);
        Ok(())
    })
    .await
    .unwrap();
    cluster.close().await;
}

/// Test that two partitions each elect a leader and converge to one after merging
#[tokio::test]
async fn test_split_brain() {
    init_test_logging();
    let mut c1 = TestCluster::new();
    create_cluster(&mut c1).await.unwrap();
    let mut c2 = TestCluster::with_network(c1.network().clone());

    // n0 keeps leading the two-node partition, the other three elect their own
    let n0 = c1.remove("n0").await.unwrap();
    c2.add("n0", n0).await.unwrap();
    let n1 = c1.remove("n1").await.unwrap();
    c2.add("n1", n1).await.unwrap();

    until_pass(40, ms(100), || {
        ensure!(c1.leaders().len() == 1, "c1 leaders: {:?}", c1.leaders());
        let leader = c1.leaders()[0].clone();
        let status = c1.status();
        ensure!(
            status.values().all(|view| view.as_ref() == Some(&leader)),
            "c1 views differ: {:?}",
            status
        );
        Ok(())
    })
    .await
    .unwrap();
    until_pass(40, ms(100), || {
        ensure!(c2.leaders() == vec![id("n0")], "c2 leaders: {:?}", c2.leaders());
        Ok(())
    })
    .await
    .unwrap();

    let c1_leader = c1.leaders()[0].clone();
    let c1_epoch = c1.leader().unwrap().epoch();
    assert!(c1_epoch > c2.leader().unwrap().epoch());
    let elections_before = elections_started(&c1) + elections_started(&c2);

    let n0 = c2.remove("n0").await.unwrap();
    c1.add("n0", n0).await.unwrap();
    let n1 = c2.remove("n1").await.unwrap();
    c1.add("n1", n1).await.unwrap();

    until_pass(40, ms(100), || {
        let status = c1.status();
        let mut views: Vec<_> = status.values().cloned().collect();
        views.dedup();
        ensure!(views.len() == 1, "views differ: {:?}", status);
        ensure!(views[0].is_some(), "no leader");
        ensure!(c1.leaders().len() == 1, "leaders: {:?}", c1.leaders());
        Ok(())
    })
    .await
    .unwrap();

    // the newer epoch wins without a fresh election
    tokio::time::sleep(ELECTION_WINDOW).await;
    assert_eq!(c1.leaders(), vec![c1_leader]);
    assert_eq!(c1.leader().unwrap().epoch(), c1_epoch);
    let elections_after = elections_started(&c1);
    assert!(
        elections_after <= elections_before + 1,
        "merge triggered {} elections",
        elections_after - elections_before
    );

    c1.close().await;
    c2.close().await;
}

/// Test that of two leaders sharing an epoch the smaller id yields and a
/// single leader emerges in the next epoch
#[tokio::test]
async fn test_equal_epoch_leaders_resolve() {
    init_test_logging();
    let mut cluster = TestCluster::new();
    create_cluster_of(&mut cluster, &["n0", "n1", "n2"]).await.unwrap();

    // n5 cannot reach anyone at startup and leads epoch 1 by itself
    cluster.add_network_error("n5");
    let n5 = cluster.spawn_node("n5", config()).await.unwrap();
    until_pass(40, ms(5), || {
        ensure!(n5.is_leader(), "n5 is not leading");
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(n5.epoch(), Epoch::new(1));
    assert_eq!(cluster.node("n0").unwrap().epoch(), Epoch::new(1));
    let elections_before = elections_started(&cluster);

    cluster.clear_errors();
    settles_within(ELECTION_WINDOW * 2, || {
        let leaders = cluster.leaders();
        ensure!(leaders.len() == 1, "leaders: {:?}", leaders);
        let leader = &leaders[0];
        let status = cluster.status();
        ensure!(
            status.values().all(|view| view.as_ref() == Some(leader)),
            "views differ: {:?}",
            status
        );
        Ok(())
    })
    .await
    .unwrap();

    let n0 = cluster.node("n0").unwrap();
    assert_eq!(n0.stats().step_downs, 1, "n0 did not yield to n5");
    assert!(cluster.leader().unwrap().epoch() >= Epoch::new(2));
    assert!(elections_started(&cluster) <= elections_before + 2);
    cluster.close().await;
}

/// Test that followers refuse a second leader of their epoch, so a leader
/// cut off from the original one cannot keep a quorum
#[tokio::test]
async fn test_followers_stay_with_their_leader() {
    init_test_logging();
    let mut cluster = TestCluster::new();
    create_cluster_of(&mut cluster, &["n0", "n1", "n2"]).await.unwrap();

    cluster.add_network_error("n5");
    let n5 = cluster.spawn_node("n5", config()).await.unwrap();
    until_pass(40, ms(5), || {
        ensure!(n5.is_leader(), "n5 is not leading");
        Ok(())
    })
    .await
    .unwrap();

    // n5 now reaches n1 and n2 but never n0
    cluster.add_peer_to_peer_error("n0", "n5");
    cluster.add_peer_to_peer_error("n5", "n0");
    cluster.del_network_error("n5");

    settles_within(ELECTION_WINDOW, || {
        let leaders = cluster.leaders();
        ensure!(leaders == vec![id("n0")], "leaders: {:?}", leaders);
        Ok(())
    })
    .await
    .unwrap();

    for _ in 0..12 {
        assert_eq!(cluster.leaders(), vec![id("n0")]);
        assert_eq!(cluster.node("n1").unwrap().leader(), Some(id("n0")));
        assert_eq!(cluster.node("n2").unwrap().leader(), Some(id("n0")));
        tokio::time::sleep(ms(400)).await;
    }
    assert_eq!(cluster.node("n0").unwrap().stats().step_downs, 0);
    cluster.close().await;
}

/// Test that a leader reaching a majority keeps leading despite omission faults
#[tokio::test]
async fn test_omission_faults() {
    init_test_logging();
    let mut cluster = TestCluster::new();
    create_cluster(&mut cluster).await.unwrap();

    // (n0)-----(n1)----(n4)
    //   \       /
    //    \     /
    //     (n2)----(n3)
    for (a, b) in [("n3", "n4"), ("n0", "n4"), ("n0", "n3"), ("n2", "n4"), ("n1", "n3")] {
        cluster.add_peer_to_peer_error(a, b);
        cluster.add_peer_to_peer_error(b, a);
    }

    for _ in 0..12 {
        let leader = cluster.leader().expect("cluster lost its leader");
        assert_eq!(leader.id(), &id("n0"));
        assert_eq!(cluster.leaders().len(), 1);
        tokio::time::sleep(ms(400)).await;
    }

    cluster.clear_errors();

    for _ in 0..12 {
        let leader = cluster.leader().expect("cluster lost its leader");
        assert_eq!(leader.id(), &id("n0"));
        assert_eq!(cluster.leaders().len(), 1);
        tokio::time::sleep(ms(400)).await;
    }

    assert_eq!(cluster.node("n0").unwrap().stats().step_downs, 0);
    until_pass(20, ms(100), || {
        let status = cluster.status();
        ensure!(
            status.values().all(|view| view == &Some(id("n0"))),
            "not everyone follows n0: {:?}",
            status
        );
        Ok(())
    })
    .await
    .unwrap();
    cluster.close().await;
}

/// Test that a cluster still settles on one leader over a slow, lossy network
#[tokio::test]
async fn test_converges_over_lossy_network() {
    init_test_logging();
    let network = SimNetwork::with_conditions(NetworkConditions {
        latency_min: ms(2),
        latency_max: ms(10),
        packet_loss_rate: 0.02,
    });
    let mut cluster = TestCluster::with_network(network);
    for name in ["a", "b", "c"] {
        cluster.spawn_node(name, config()).await.unwrap();
    }

    until_pass(60, ms(100), || {
        let leaders = cluster.leaders();
        ensure!(leaders.len() == 1, "leaders: {:?}", leaders);
        let status = cluster.status();
        ensure!(
            status.values().all(|view| view.as_ref() == Some(&leaders[0])),
            "views differ: {:?}",
            status
        );
        Ok(())
    })
    .await
    .unwrap();
    assert!(cluster.network().stats().messages_delivered > 0);
    cluster.close().await;
}
