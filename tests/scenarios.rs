//! End-to-end scheduling scenarios driven through the public interface.

use bwfq::scheduler::{SchedParams, Scheduler};
use bwfq::vtime::service_delta;

const BUDGET: u64 = 512;

/// Serve one full slot: select, charge the whole budget, expire, requeue.
fn dispatch(sched: &mut Scheduler, now: u64) -> bwfq::entity::EntityId {
    let q = sched.get_next_queue(now).expect("a queue is busy");
    sched.served(q, BUDGET);
    sched.reset_in_service();
    sched.requeue(q);
    q
}

#[test]
fn weighted_fairness_between_two_queues() {
    let mut sched = Scheduler::new(SchedParams::default());
    let a = sched.add_queue(None, 100, 0);
    let b = sched.add_queue(None, 300, 0);
    for q in [a, b] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    let (mut sa, mut sb) = (0u64, 0u64);
    for _ in 0..1000 {
        let q = dispatch(&mut sched, 0);
        if q == a {
            sa += BUDGET;
        } else {
            sb += BUDGET;
        }
    }
    sched.validate();

    assert!(sa > 0 && sb > 0, "both queues must be served");
    let ratio = sa as f64 / sb as f64;
    // one slot of slack on each side of the ideal split covers timestamp
    // truncation in the service-to-vtime mapping
    let bound = 4.0 * BUDGET as f64 / (sa + sb) as f64;
    assert!(
        (ratio - 1.0 / 3.0).abs() <= bound,
        "service ratio {ratio} strayed from 1/3 by more than {bound}"
    );
}

#[test]
fn backshifted_reactivation_lands_on_vtime() {
    let mut sched = Scheduler::new(SchedParams::default());
    let a = sched.add_queue(None, 100, 0);
    let b = sched.add_queue(None, 100, 0);
    for q in [a, b] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    // drain A so only its stale finish timestamp survives
    sched.del_busy(a, false);
    let stale_finish = sched.entity(a).finish();
    assert_eq!(stale_finish, service_delta(BUDGET, 100));

    // B alone pushes the virtual time far past A's stale finish
    for _ in 0..3 {
        let q = dispatch(&mut sched, 0);
        assert_eq!(q, b);
    }
    let vtime = sched.service_tree(None, 0).vtime();
    assert!(vtime > stale_finish + service_delta(BUDGET, 100));

    // waking A with non_blocking_wait backshifts it, but only down to the
    // point where its finish lands exactly on the current vtime
    sched.add_busy(a, true);
    assert_eq!(sched.entity(a).finish(), vtime);
    assert!(sched.entity(a).start() < vtime);
    sched.validate();
}

#[test]
fn starved_idle_class_gets_a_forced_pick() {
    let params = SchedParams {
        num_classes: 4,
        ..SchedParams::default()
    };
    let interval = params.class_idle_timeout;
    let mut sched = Scheduler::new(params);
    let d = sched.add_queue(None, 100, 0);
    let e = sched.add_queue(None, 100, 3);
    for q in [d, e] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    // within the interval the higher class always wins
    assert_eq!(dispatch(&mut sched, 0), d);
    assert_eq!(dispatch(&mut sched, 1), d);

    // twice the starvation interval later, the idle class is rescued
    let late = 2 * interval;
    assert_eq!(dispatch(&mut sched, late), e);
    assert_eq!(sched.class_idle_last_service(), late);

    // the rescue reset the timer, so the next pick is class 0 again
    assert_eq!(dispatch(&mut sched, late), d);
    sched.validate();
}

#[test]
fn weight_change_applies_at_next_activation() {
    let mut sched = Scheduler::new(SchedParams::default());
    let q = sched.add_queue(None, 100, 0);
    sched.set_budget(q, BUDGET);
    sched.add_busy(q, false);
    assert_eq!(sched.entity(q).weight(), 100);
    assert_eq!(sched.service_tree(None, 0).wsum(), 100);

    sched.update_weight(q, 200);
    // pending until the next activation
    assert_eq!(sched.entity(q).weight(), 100);

    sched.requeue(q);
    assert_eq!(sched.entity(q).weight(), 200);
    assert_eq!(sched.service_tree(None, 0).wsum(), 200);
    sched.validate();
}

#[test]
fn class_change_moves_the_queue_between_trees() {
    let mut sched = Scheduler::new(SchedParams::default());
    let q = sched.add_queue(None, 100, 0);
    sched.set_budget(q, BUDGET);
    sched.add_busy(q, false);
    assert_eq!(sched.service_tree(None, 0).wsum(), 100);

    sched.set_class(q, 1);
    sched.requeue(q);
    assert_eq!(sched.entity(q).priority_class(), 1);
    assert_eq!(sched.service_tree(None, 0).wsum(), 0);
    assert_eq!(sched.service_tree(None, 1).wsum(), 100);
    // the move re-anchors the start to the new tree's clock
    assert_eq!(sched.entity(q).start(), sched.service_tree(None, 1).vtime());
    sched.validate();
}

#[test]
fn weight_raising_scales_the_effective_weight() {
    let mut sched = Scheduler::new(SchedParams::default());
    let q = sched.add_queue(None, 100, 0);
    sched.set_budget(q, BUDGET);
    sched.set_wr_coeff(q, 3);
    sched.add_busy(q, false);

    assert_eq!(sched.entity(q).weight(), 300);
    assert_eq!(sched.service_tree(None, 0).wsum(), 300);
    assert_eq!(sched.wr_busy_queues(), 1);
    // raised queues are kept out of the weight counters
    assert_eq!(sched.queue_weights().count(300), 0);
    sched.validate();

    sched.del_busy(q, false);
    assert_eq!(sched.wr_busy_queues(), 0);
}

#[test]
fn in_service_deactivation_charges_actual_service() {
    let mut sched = Scheduler::new(SchedParams::default());
    let a = sched.add_queue(None, 100, 0);
    let b = sched.add_queue(None, 100, 0);
    for q in [a, b] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    let q = sched.get_next_queue(0).expect("two busy queues");
    let start = sched.entity(q).start();
    sched.served(q, BUDGET / 2);
    sched.reset_in_service();
    sched.del_busy(q, true);

    // the finish reflects the half budget actually consumed
    assert_eq!(
        sched.entity(q).finish(),
        start.wrapping_add(service_delta(BUDGET / 2, 100))
    );
    // its credit is unexpired, so the queue parks on the idle tree
    assert!(sched.entity(q).on_idle_tree());
    assert!(sched.entity(q).is_attached());
    sched.validate();
}

#[test]
fn group_stays_active_while_a_sibling_is_backlogged() {
    let mut sched = Scheduler::new(SchedParams::default());
    let g = sched.add_group(None, 100);
    let l1 = sched.add_queue(Some(g), 100, 0);
    let l2 = sched.add_queue(Some(g), 100, 0);

    sched.add_busy(l1, false);
    assert!(sched.entity(g).is_attached());

    sched.add_busy(l2, false);
    sched.del_busy(l1, true);

    // the group keeps its backlog through l2 and its cache points there
    assert!(sched.entity(g).is_attached());
    assert_eq!(sched.next_in_service(Some(g)), Some(l2));
    assert_eq!(sched.busy_queues(), 1);
    sched.validate();

    // draining the last leaf empties the group: it leaves the active tree
    // (parking on the idle tree while its own credit lasts) and the root
    // has nothing left to pick
    sched.del_busy(l2, false);
    assert!(!sched.entity(g).on_active_tree());
    assert_eq!(sched.next_in_service(None), None);
    assert_eq!(sched.busy_queues(), 0);
    assert_eq!(sched.get_next_queue(0), None);
    sched.validate();
}

#[test]
fn unserved_round_trip_restores_the_finish_time() {
    let mut sched = Scheduler::new(SchedParams::default());
    let a = sched.add_queue(None, 100, 0);
    let b = sched.add_queue(None, 100, 0);
    for q in [a, b] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    let q = sched.get_next_queue(0).expect("two busy queues");
    let finish_before = sched.entity(q).finish();

    // slot abandoned with zero service consumed
    sched.reset_in_service();
    sched.del_busy(q, true);
    sched.add_busy(q, false);

    assert_eq!(sched.entity(q).finish(), finish_before);
    sched.validate();
}

#[test]
fn idle_park_preserves_virtual_position() {
    let mut sched = Scheduler::new(SchedParams::default());
    let a = sched.add_queue(None, 100, 0);
    let b = sched.add_queue(None, 100, 0);
    for q in [a, b] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    // park A while its credit is still good (B keeps the vtime pinned low)
    let parked_finish = sched.entity(a).finish();
    sched.del_busy(a, true);
    assert!(sched.entity(a).on_idle_tree());

    // on reactivation the entity resumes from its preserved finish rather
    // than restarting at the (smaller) current vtime
    sched.add_busy(a, false);
    assert_eq!(sched.entity(a).start(), parked_finish);
    sched.validate();
}

#[test]
fn time_charging_inflates_slow_queues() {
    let mut sched = Scheduler::new(SchedParams::default());
    let a = sched.add_queue(None, 100, 0);
    let b = sched.add_queue(None, 100, 0);
    for q in [a, b] {
        sched.add_busy(q, false);
    }
    let max_budget = sched.params().max_budget;
    let timeout = sched.params().slice_timeout_ms;

    let q = sched.get_next_queue(0).expect("two busy queues");
    // a slow queue: tiny service over most of its slot
    sched.served(q, 64);
    sched.charge_time(q, timeout / 2);

    // charged as if it had run at full rate for half the slot
    let expected = max_budget * (timeout / 2) / timeout;
    assert_eq!(sched.entity(q).service(), expected);
    assert!(sched.entity(q).budget() >= expected);
    sched.validate();
}

#[test]
fn preemption_hint_tracks_root_cache() {
    let mut sched = Scheduler::new(SchedParams::default());
    let a = sched.add_queue(None, 100, 0);
    sched.set_budget(a, BUDGET);

    // nothing waiting, nothing serving: the caches agree
    assert!(!sched.next_may_preempt());

    // an arrival wants the device
    sched.add_busy(a, false);
    assert!(sched.next_may_preempt());
    sched.validate();
}

#[test]
fn released_queue_slot_survives_until_trees_let_go() {
    let mut sched = Scheduler::new(SchedParams::default());
    let a = sched.add_queue(None, 100, 0);
    let b = sched.add_queue(None, 100, 0);
    for q in [a, b] {
        sched.set_budget(q, BUDGET);
        sched.add_busy(q, false);
    }

    // park A on the idle tree, then drop the caller's reference; the tree's
    // reference keeps the entity alive until forget_idle expires it
    sched.del_busy(a, true);
    sched.release_queue(a);
    assert!(sched.entity(a).on_idle_tree());

    // serving B walks vtime past A's finish; the lazy GC then frees A
    for _ in 0..3 {
        dispatch(&mut sched, 0);
    }
    assert_eq!(sched.service_tree(None, 0).wsum(), 100);
    sched.validate();
}
