use bwfq::entity::EntityId;
use bwfq::metrics::{LiveSnapshot, QueueSnapshot, now_ms, write_snapshot};
use bwfq::scheduler::{SchedParams, Scheduler};

/// How much service every demo queue may consume per slot.
const BUDGET: u64 = 512;

/// Tracks cumulative service per queue across slots (the engine's own
/// per-slot counter resets every time a slot starts).
struct Workload<'a> {
    name: &'a str,
    queues: Vec<(EntityId, &'a str)>,
    totals: Vec<u64>,
    dispatches: u64,
}

impl<'a> Workload<'a> {
    fn new(name: &'a str, queues: Vec<(EntityId, &'a str)>) -> Self {
        let totals = vec![0; queues.len()];
        Workload {
            name,
            queues,
            totals,
            dispatches: 0,
        }
    }

    /// One full slot: pick the next queue, serve its whole budget, expire
    /// and requeue it.
    fn dispatch(&mut self, sched: &mut Scheduler, now: u64) -> EntityId {
        let q = sched
            .get_next_queue(now)
            .expect("workload has busy queues");
        sched.served(q, BUDGET);
        sched.reset_in_service();
        sched.requeue(q);

        if let Some(i) = self.queues.iter().position(|&(id, _)| id == q) {
            self.totals[i] += BUDGET;
        }
        self.dispatches += 1;
        q
    }

    fn total(&self, q: EntityId) -> u64 {
        self.queues
            .iter()
            .position(|&(id, _)| id == q)
            .map_or(0, |i| self.totals[i])
    }

    fn snapshot(&self, sched: &Scheduler, status: &str, now: u64, planned: u64) {
        let grand_total: u64 = self.totals.iter().sum();
        let weight_total: u64 = self.queues.iter().map(|&(id, _)| sched.entity(id).weight()).sum();

        let queues = self
            .queues
            .iter()
            .zip(&self.totals)
            .map(|(&(id, name), &total)| {
                let e = sched.entity(id);
                QueueSnapshot {
                    name: name.to_string(),
                    weight: e.weight(),
                    service_total: total,
                    share_pct: if grand_total > 0 {
                        total as f64 / grand_total as f64 * 100.0
                    } else {
                        0.0
                    },
                    fair_share_pct: if weight_total > 0 {
                        e.weight() as f64 / weight_total as f64 * 100.0
                    } else {
                        0.0
                    },
                    busy: e.is_busy(),
                    in_service: sched.in_service_queue() == Some(id),
                    start: e.start(),
                    finish: e.finish(),
                }
            })
            .collect();

        // root tree carrying the most weight, i.e. the one this phase drives
        let root_tree = (0..sched.params().num_classes)
            .map(|class| sched.service_tree(None, class))
            .max_by_key(|st| st.wsum())
            .expect("at least one priority class");
        write_snapshot(&LiveSnapshot {
            status: status.to_string(),
            workload: self.name.to_string(),
            ticks: now,
            dispatches: self.dispatches,
            dispatches_total: planned,
            busy_queues: sched.busy_queues(),
            vtime: root_tree.vtime(),
            wsum: root_tree.wsum(),
            queues,
            timestamp_ms: now_ms(),
        });
    }
}

fn main() {
    simple_logger::init_with_level(log::Level::Info).ok();

    // -----------------------------------------------------------------------
    // Phase 1: two flat queues, weights 100 vs 300
    // -----------------------------------------------------------------------
    let mut sched = Scheduler::new(SchedParams::default());
    let a = sched.add_queue(None, 100, 0);
    let b = sched.add_queue(None, 300, 0);
    for q in [a, b] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    let mut flat = Workload::new("flat 100:300", vec![(a, "A"), (b, "B")]);
    let rounds = 1000u64;
    println!(
        "[bwfq] Phase 1: queues A (weight 100) and B (weight 300), {} slots of {} units",
        rounds, BUDGET,
    );

    for i in 0..rounds {
        flat.dispatch(&mut sched, 0);
        if i % 20 == 0 {
            flat.snapshot(&sched, "running", 0, rounds);
        }
    }
    flat.snapshot(&sched, "complete", 0, rounds);

    let (sa, sb) = (flat.total(a), flat.total(b));
    let ratio = sa as f64 / sb as f64;
    println!(
        "[bwfq] Phase 1 done: A={} B={} | ratio={:.4} (ideal 0.3333)",
        sa, sb, ratio,
    );
    let bound = BUDGET as f64 / (sa + sb) as f64;
    if (ratio - 1.0 / 3.0).abs() <= bound {
        println!("[bwfq] Phase 1 PASSED: lag within one budget of the ideal split");
    } else {
        println!("[bwfq] Phase 1 FAILED: lag {:.5} exceeds bound {:.5}", (ratio - 1.0 / 3.0).abs(), bound);
    }

    // -----------------------------------------------------------------------
    // Phase 2: hierarchy: group G (weight 200, two equal leaves) vs queue C
    // -----------------------------------------------------------------------
    let mut sched = Scheduler::new(SchedParams::default());
    let g = sched.add_group(None, 200);
    let l1 = sched.add_queue(Some(g), 100, 0);
    let l2 = sched.add_queue(Some(g), 100, 0);
    let c = sched.add_queue(None, 100, 1);
    for q in [l1, l2, c] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    let mut tree = Workload::new(
        "group 200 vs queue 100",
        vec![(l1, "G/L1"), (l2, "G/L2"), (c, "C")],
    );
    println!(
        "[bwfq] Phase 2: group G (weight 200) holding L1+L2 vs top-level C (weight 100)",
    );
    for i in 0..rounds {
        tree.dispatch(&mut sched, 0);
        if i % 20 == 0 {
            tree.snapshot(&sched, "running", 0, rounds);
        }
    }
    tree.snapshot(&sched, "complete", 0, rounds);

    let (s1, s2, sc) = (tree.total(l1), tree.total(l2), tree.total(c));
    println!(
        "[bwfq] Phase 2 done: L1={} L2={} C={} | group/C={:.3} (ideal 2.0) L1/L2={:.3} (ideal 1.0)",
        s1,
        s2,
        sc,
        (s1 + s2) as f64 / sc as f64,
        s1 as f64 / s2 as f64,
    );

    // -----------------------------------------------------------------------
    // Phase 3: idle-class starvation rescue
    // -----------------------------------------------------------------------
    let mut sched = Scheduler::new(SchedParams::default());
    let idle_class = sched.params().num_classes - 1;
    let d = sched.add_queue(None, 100, 0);
    let e = sched.add_queue(None, 100, idle_class);
    for q in [d, e] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    let mut starv = Workload::new("idle-class rescue", vec![(d, "D"), (e, "E")]);
    let interval = sched.params().class_idle_timeout;
    println!(
        "[bwfq] Phase 3: D (class 0) vs E (idle class {}), rescue interval {} ticks",
        idle_class, interval,
    );
    let mut now = 0u64;
    for i in 0..rounds {
        starv.dispatch(&mut sched, now);
        now += 1;
        if i % 20 == 0 {
            starv.snapshot(&sched, "running", now, rounds);
        }
    }
    starv.snapshot(&sched, "complete", now, rounds);

    let rescued = starv.total(e) / BUDGET;
    println!(
        "[bwfq] Phase 3 done: D={} E={} | E rescued {} times over {} ticks (~1 per {} ticks)",
        starv.total(d),
        starv.total(e),
        rescued,
        now,
        if rescued > 0 { now / rescued } else { 0 },
    );

    println!("[bwfq] run `cargo run --bin viz` in another terminal to watch live");
}
