//! Multi-node scenarios: election, routing, delivery, time sync, partitions.
//!
//! Everything runs on simulated time; no test sleeps.

use wildmesh_core::config::{MeshConfig, RoutingConfig};
use wildmesh_core::events::MeshEvent;
use wildmesh_core::packet::NodeId;
use wildmesh_core::routing::RouteManager;
use wildmesh_core::simulation::{MeshSimulator, SimConfig, Topology};
use wildmesh_core::traits::test_impls::{ManualClock, MemoryTransport};
use wildmesh_core::traits::Clock;
use wildmesh_core::MeshNode;

const MINUTE: u64 = 60_000;

fn line(nodes: usize) -> SimConfig {
    SimConfig::default()
        .with_node_count(nodes)
        .with_topology(Topology::Line)
        .with_seed(7)
}

fn converge(sim: &mut MeshSimulator) {
    let settled = sim.run_until(30 * MINUTE, |s| s.all_joined() && s.coordinators().len() == 1);
    assert!(settled, "mesh did not settle: {:?}", sim.report());
}

#[test]
fn test_isolated_node_self_promotes_after_five_rounds() {
    let clock = ManualClock::at(0);
    let config = MeshConfig::for_node(NodeId::from_u32(0x0B00_0001));
    let mut node = MeshNode::new(config, MemoryTransport::new(), clock.clone()).unwrap();

    // First round at t=0, then one failed attempt per minute
    node.tick();
    while clock.now_ms() < 5 * MINUTE - 1_000 {
        clock.advance(1_000);
        node.tick();
        assert!(!node.is_coordinator(), "promoted early at {}", clock.now_ms());
    }
    clock.advance(1_000);
    node.tick();
    assert!(node.is_coordinator());
    assert!(node.is_network_joined());
    assert_eq!(node.get_coordinator_id(), node.node_id());
    assert!(node.drain_events().contains(&MeshEvent::BecameCoordinator));
}

#[test]
fn test_dijkstra_prefers_reliable_two_hop_path() {
    let (a, b, c) = (NodeId::from_u32(1), NodeId::from_u32(2), NodeId::from_u32(3));
    let mut routes = RouteManager::new(a, RoutingConfig::default());
    routes.observe_neighbor(b, 0.9, 0);
    routes.observe_neighbor(c, 0.3, 0);
    routes.record_remote_link(b, c, 0.8, 0);

    // Direct route first, from hearing C
    assert_eq!(routes.route(c, 0).unwrap().next_hop, c);

    routes.recompute_routes(1_000);
    let best = routes.find_best_route(c, 1_000).unwrap();
    assert_eq!(best.next_hop, b);
    assert_eq!(best.hop_count, 2);
}

#[test]
fn test_dijkstra_over_radio_links() {
    let mut node = MeshConfig::default();
    // Keep the two-hop route in place for this check
    node.routing.load_balance_threshold = 1.0;
    let config = SimConfig::default()
        .with_node_count(3)
        .with_topology(Topology::Explicit(vec![(0, 1, 0.9), (1, 2, 0.8), (0, 2, 0.3)]))
        .with_node_config(node);
    let mut sim = MeshSimulator::new(config).unwrap();
    sim.run_for(3 * MINUTE);

    let b = sim.node_id(1).unwrap();
    let c = sim.node_id(2).unwrap();
    let a_node = sim.node(0).unwrap();
    let route = a_node.routes().route(c, a_node.now_ms()).unwrap();
    assert_eq!(route.next_hop, b);
}

#[test]
fn test_line_elects_highest_id_coordinator() {
    let mut sim = MeshSimulator::new(line(4)).unwrap();
    converge(&mut sim);

    let highest = sim.node_id(3).unwrap();
    assert_eq!(sim.coordinators(), vec![highest]);
    for i in 0..sim.len() {
        assert_eq!(sim.node(i).unwrap().get_coordinator_id(), highest);
    }
    assert!(sim
        .events()
        .iter()
        .any(|e| e.node == highest && e.event == MeshEvent::BecameCoordinator));
}

/// Largest disagreement seen while stepping `duration_ms`, sampled each
/// `every_ms`
fn peak_disagreement(sim: &mut MeshSimulator, duration_ms: u64, every_ms: u64) -> u64 {
    let mut peak = 0;
    let mut elapsed = 0;
    while elapsed < duration_ms {
        sim.run_for(every_ms);
        elapsed += every_ms;
        peak = peak.max(sim.max_time_disagreement_ms());
    }
    peak
}

#[test]
fn test_line_synchronizes_time() {
    let mut sim = MeshSimulator::new(line(4).with_clock_skew(10_000, 0.0)).unwrap();
    converge(&mut sim);

    assert!(sim.run_until(30 * MINUTE, |s| s.all_synchronized()));
    // Let every reference history turn over
    sim.run_for(20 * MINUTE);

    // Within one simulation step, across three hops from the source
    let peak = peak_disagreement(&mut sim, 20 * MINUTE, 30_000);
    assert!(peak < 250, "disagreement peaked at {} ms", peak);

    let report = sim.report();
    assert_eq!(report.synchronized, 4);
    let coordinator = sim.node(3).unwrap();
    assert_eq!(coordinator.time_sync().local_stratum(coordinator.now_ms()), 1);
    let far = sim.node(0).unwrap();
    assert_eq!(far.time_sync().local_stratum(far.now_ms()), 4);
}

#[test]
fn test_exact_clocks_stay_within_threshold_under_traffic() {
    let config = line(2).with_clock_skew(0, 0.0).with_message_rate(0.2);
    let threshold = config.node.sync.offset_threshold_ms as u64;
    let mut sim = MeshSimulator::new(config).unwrap();
    converge(&mut sim);
    assert!(sim.run_until(30 * MINUTE, |s| s.all_synchronized()));
    sim.run_for(10 * MINUTE);

    // Queueing delay must not leak into the offset
    let peak = peak_disagreement(&mut sim, 40 * MINUTE, 15_000);
    assert!(
        peak <= 2 * threshold + 5,
        "disagreement peaked at {} ms with exact clocks",
        peak
    );
    assert!(sim.stats().payloads_sent > 0);
}

#[test]
fn test_unicast_delivery_across_hops() {
    let mut sim = MeshSimulator::new(line(4)).unwrap();
    converge(&mut sim);

    assert!(sim.send_payload(0, Some(3), b"soil=41%"));
    let far = sim.node_id(3).unwrap();
    let delivered = sim.run_until(2 * MINUTE, |s| {
        s.deliveries().iter().any(|d| d.receiver == far)
    });
    assert!(delivered);

    let d = sim
        .deliveries()
        .iter()
        .find(|d| d.receiver == far)
        .unwrap();
    assert_eq!(d.payload.data, b"soil=41%".to_vec());
    assert_eq!(d.payload.source, sim.node_id(0).unwrap());
    assert!(d.payload.hop_count >= 2);
}

#[test]
fn test_broadcast_reaches_every_node_once() {
    let mut sim = MeshSimulator::new(line(5)).unwrap();
    converge(&mut sim);

    assert!(sim.send_payload(2, None, b"alarm"));
    sim.run_for(MINUTE);

    let mut receivers: Vec<NodeId> = sim
        .deliveries()
        .iter()
        .filter(|d| d.payload.data == b"alarm".to_vec())
        .map(|d| d.receiver)
        .collect();
    receivers.sort();
    let mut expected: Vec<NodeId> = [0, 1, 3, 4].iter().map(|&i| sim.node_id(i).unwrap()).collect();
    expected.sort();
    assert_eq!(receivers, expected);
}

#[test]
fn test_partition_and_heal() {
    let mut sim = MeshSimulator::new(line(6)).unwrap();
    converge(&mut sim);
    let top = sim.node_id(5).unwrap();
    assert_eq!(sim.coordinators(), vec![top]);

    sim.partition(&[0, 1, 2]);
    let split = sim.run_until(90 * MINUTE, |s| {
        let left: Vec<NodeId> = (0..3)
            .map(|i| s.node(i).unwrap())
            .filter(|n| n.is_coordinator())
            .map(|n| n.node_id())
            .collect();
        left.len() == 1
            && (0..3).all(|i| {
                let n = s.node(i).unwrap();
                n.is_network_joined() && n.get_coordinator_id() == left[0]
            })
    });
    assert!(split, "left side never elected its own coordinator: {:?}", sim.report());
    assert_eq!(sim.coordinators().len(), 2);
    assert_eq!(sim.node(4).unwrap().get_coordinator_id(), top);
    assert!(sim.events().iter().any(|e| {
        e.node == sim.node_id(0).unwrap()
            && matches!(e.event, MeshEvent::CoordinatorLost { coordinator } if coordinator == top)
    }));

    sim.heal();
    let merged = sim.run_until(30 * MINUTE, |s| {
        s.coordinators() == vec![top]
            && (0..s.len()).all(|i| s.node(i).unwrap().get_coordinator_id() == top)
    });
    assert!(merged, "mesh did not merge: {:?}", sim.report());
}

#[test]
fn test_coordinator_failure_triggers_reelection() {
    let mut sim = MeshSimulator::new(line(3)).unwrap();
    converge(&mut sim);
    let old = sim.node_id(2).unwrap();

    sim.set_online(2, false);
    let reelected = sim.run_until(90 * MINUTE, |s| {
        let c = s.coordinators();
        c.len() == 1 && c[0] != old && s.all_joined()
    });
    assert!(reelected, "no new coordinator: {:?}", sim.report());
}

#[test]
fn test_random_traffic_is_delivered() {
    let config = SimConfig::default()
        .with_node_count(6)
        .with_topology(Topology::Ring)
        .with_seed(11);
    let mut sim = MeshSimulator::new(config).unwrap();
    converge(&mut sim);

    let mut sent = sim.stats().payloads_sent;
    for i in 0..6 {
        let to = (i + 2) % 6;
        if sim.send_payload(i, Some(to), format!("reading {}", i).as_bytes()) {
            sent += 1;
        }
        sim.run_for(10_000);
    }
    sim.run_for(2 * MINUTE);

    assert_eq!(sim.stats().payloads_sent, sent);
    let delivered = sim
        .deliveries()
        .iter()
        .filter(|d| d.payload.data.starts_with(b"reading"))
        .count();
    assert!(delivered >= 5, "only {} of 6 delivered", delivered);
}

#[test]
fn test_lossy_links_still_converge() {
    let mut sim = MeshSimulator::new(line(4).with_loss(0.2).with_seed(3)).unwrap();
    let settled = sim.run_until(60 * MINUTE, |s| s.all_joined() && s.coordinators().len() == 1);
    assert!(settled, "{:?}", sim.report());
    assert!(sim.stats().frames_lost > 0);
}

#[test]
fn test_report_serializes() {
    let mut sim = MeshSimulator::new(line(3)).unwrap();
    sim.run_for(MINUTE);
    let json = serde_json::to_string(&sim.report()).unwrap();
    assert!(json.contains("\"max_time_disagreement_ms\""));
    assert!(json.contains("\"per_node\""));
}
