use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cotask::{
    BusError, Event, EventKind, Matcher, Routine, RoutineError, RoutineOptions, RoutineState,
    Scheduler, SchedulerConfig,
};

const STEP: EventKind = EventKind::new("step");

fn on(n: u64) -> Matcher {
    Matcher::new(STEP).with("n", n)
}

fn step(n: u64) -> Event {
    Event::new(STEP).with("n", n)
}

#[test]
fn test_exactly_one_waitset_registered_per_step() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
        ctx.wait_for([on(1), on(2)]).await?;
        ctx.wait_for(on(3)).await?;
        ctx.wait_for([on(4), on(5)]).await?;
        Ok(())
    })
    .unwrap();

    assert_eq!(sched.registrations(r.id()), vec![on(1), on(2)]);

    sched.send_event(step(2));
    sched.run_until_idle();
    assert_eq!(sched.registrations(r.id()), vec![on(3)]);

    sched.send_event(step(3));
    sched.run_until_idle();
    assert_eq!(sched.registrations(r.id()), vec![on(4), on(5)]);

    sched.send_event(step(5));
    sched.run_until_idle();
    assert!(sched.registrations(r.id()).is_empty());
    assert_eq!(r.state(), RoutineState::Finished);
}

#[test]
fn test_one_event_matching_two_conditions_resumes_once() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let resumes = Rc::new(Cell::new(0));
    let counter = resumes.clone();
    Routine::spawn(sched.bus(), RoutineOptions::sync(), None, move |ctx| async move {
        ctx.wait_for([Matcher::new(STEP), on(1)]).await?;
        counter.set(counter.get() + 1);
        ctx.wait_for(on(9)).await?;
        counter.set(counter.get() + 1);
        Ok(())
    })
    .unwrap();

    sched.send_event(step(1));
    sched.run_until_idle();
    assert_eq!(resumes.get(), 1);
}

#[test]
fn test_no_registrations_after_any_termination() {
    let sched = Scheduler::new(SchedulerConfig::default());

    let normal = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
        ctx.wait_for(on(1)).await?;
        Ok(())
    })
    .unwrap();
    let failing = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
        ctx.wait_for(on(1)).await?;
        Err(RoutineError::failed("broken"))
    })
    .unwrap();
    let closed = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
        ctx.wait_for(on(2)).await?;
        Ok(())
    })
    .unwrap();

    sched.send_event(step(1));
    sched.run_until_idle();
    closed.close().unwrap();

    assert_eq!(normal.state(), RoutineState::Finished);
    assert_eq!(failing.state(), RoutineState::Failed);
    assert_eq!(closed.state(), RoutineState::Closed);
    for r in [&normal, &failing, &closed] {
        assert!(sched.registrations(r.id()).is_empty());
    }
    assert_eq!(sched.listener_count(), 0);
}

#[test]
fn test_cleanup_may_wait_before_terminating() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, move |ctx| async move {
        let res = ctx.wait_for(on(1)).await;
        if let Err(RoutineError::Closed) = res {
            sink.borrow_mut().push("closing");
            ctx.wait_for(on(2)).await?;
            sink.borrow_mut().push("flushed");
        }
        Ok(())
    })
    .unwrap();

    r.close().unwrap();
    assert_eq!(r.state(), RoutineState::Closing);

    sched.send_event(step(2));
    sched.run_until_idle();
    assert_eq!(*log.borrow(), vec!["closing", "flushed"]);
    assert_eq!(r.state(), RoutineState::Closed);
    assert_eq!(sched.listener_count(), 0);
}

#[test]
fn test_cleanup_wait_after_shutdown_drops_body() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let seen = Rc::new(RefCell::new(None));
    let sink = seen.clone();
    let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, move |ctx| async move {
        match ctx.wait_for(on(1)).await {
            Err(RoutineError::Quit) => {}
            other => {
                other?;
            }
        }
        // Accepted: registered while the quit is being handled.
        ctx.wait_for(on(2)).await?;
        if let Err(err) = ctx.wait_for(on(3)).await {
            *sink.borrow_mut() = Some(err.clone());
            return Err(err);
        }
        Ok(())
    })
    .unwrap();

    sched.quit();
    assert_eq!(r.state(), RoutineState::Closing);
    assert_eq!(sched.registrations(r.id()), vec![on(2)]);

    sched.send_event(step(2));
    sched.run_until_idle();
    assert!(seen.borrow().is_none());
    assert_eq!(r.state(), RoutineState::Closed);
    assert!(r.error().is_none());
    assert!(sched.take_errors().is_empty());
    assert_eq!(sched.listener_count(), 0);
}

#[test]
fn test_quit_from_inside_a_step_closes_the_routine() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let bus = sched.clone();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let r = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, move |ctx| async move {
        ctx.wait_for(on(1)).await?;
        bus.quit();
        let res = ctx.wait_for(on(2)).await;
        sink.borrow_mut().push(res.as_ref().err().map(|e| e.as_label()));
        res?;
        Ok(())
    })
    .unwrap();

    sched.send_event(step(1));
    sched.run_until_idle();
    assert_eq!(*seen.borrow(), vec![Some("routine_quit")]);
    assert_eq!(r.state(), RoutineState::Closed);
    assert!(r.error().is_none());
    assert!(sched.take_errors().is_empty());
    assert_eq!(sched.listener_count(), 0);
}

#[test]
fn test_awaiting_foreign_future_is_illegal() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let res = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |_ctx| async move {
        futures::future::pending::<()>().await;
        Ok(())
    });
    assert!(matches!(
        res,
        Err(RoutineError::IllegalWaitSet {
            reason: BusError::NoWaitPoint,
            ..
        })
    ));
    assert_eq!(sched.listener_count(), 0);
}

#[test]
fn test_two_concurrent_waits_are_illegal() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let res = Routine::spawn(sched.bus(), RoutineOptions::sync(), None, |ctx| async move {
        let (a, b) = futures::join!(ctx.wait_for(on(1)), ctx.wait_for(on(2)));
        a?;
        b?;
        Ok(())
    });
    assert!(matches!(
        res,
        Err(RoutineError::IllegalWaitSet {
            reason: BusError::MultipleWaitPoints,
            ..
        })
    ));
    assert_eq!(sched.listener_count(), 0);
}
