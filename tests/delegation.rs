use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cotask::{
    Container, EventHandler, EventKind, Matcher, RoutineControl, RoutineError, RoutineState,
    Scheduler, SchedulerConfig, Value,
};

const WORK: EventKind = EventKind::new("work");

/// Counts delegate-finished events carrying a result or an error.
fn watch_finished(sched: &Rc<Scheduler>) -> (EventHandler, Rc<Cell<u32>>) {
    let handler = EventHandler::new(sched.bus());
    let count = Rc::new(Cell::new(0));
    let counter = count.clone();
    handler
        .register(
            Matcher::new(cotask::events::control::ROUTINE_CONTROL)
                .with("type", RoutineControl::DelegateFinished.as_str()),
            move |_, _| {
                counter.set(counter.get() + 1);
                Ok(())
            },
        )
        .unwrap();
    (handler, count)
}

#[test]
fn test_delegate_returns_typed_result() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let (_watch, finished) = watch_finished(&sched);
    let container = Container::new(sched.bus());
    let out = Rc::new(RefCell::new(None));
    let sink = out.clone();
    let main = container
        .start(true, move |ctx| async move {
            let answer = ctx
                .delegate(|sub| async move {
                    let got = sub.wait_for(Matcher::new(WORK)).await?;
                    Ok(format!("done:{}", got.event.seq() > 0))
                })
                .await?;
            *sink.borrow_mut() = Some(answer);
            Ok(())
        })
        .unwrap();

    sched.run_until_idle();
    assert_eq!(main.state(), RoutineState::Active);

    sched.send_event(cotask::Event::new(WORK));
    sched.run_until_idle();
    assert_eq!(out.borrow().as_deref(), Some("done:true"));
    assert_eq!(finished.get(), 1);
    assert_eq!(main.state(), RoutineState::Finished);
}

#[test]
fn test_delegate_error_surfaces_at_caller() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let (_watch, finished) = watch_finished(&sched);
    let container = Container::new(sched.bus());
    let out = Rc::new(RefCell::new(None));
    let sink = out.clone();
    container
        .start(true, move |ctx| async move {
            let res = ctx
                .delegate(|_sub| async move { Err::<u32, _>(RoutineError::failed("db down")) })
                .await;
            *sink.borrow_mut() = Some(res.map_err(|e| e.to_string()));
            Ok(())
        })
        .unwrap();

    sched.run_until_idle();
    assert_eq!(
        *out.borrow(),
        Some(Err("routine failed: db down".to_string()))
    );
    assert_eq!(finished.get(), 1);
    // The delegate's own failure is also reported to the bus.
    assert_eq!(sched.take_errors().len(), 1);
}

#[test]
fn test_delegate_in_other_container() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let front = Container::new(sched.bus());
    let back = Container::new(sched.bus());
    let back_handle = back.clone();
    let ran_in = Rc::new(Cell::new(None));
    let sink = ran_in.clone();
    let result = Rc::new(Cell::new(0u64));
    let out = result.clone();
    front
        .start(true, move |ctx| async move {
            let v = ctx
                .delegate_in(&back_handle, move |sub| async move {
                    sink.set(sub.container().and_then(|c| c.current_routine()));
                    Ok(sub.id().get())
                })
                .await?;
            out.set(v);
            Ok(())
        })
        .unwrap();

    sched.run_until_idle();
    assert_ne!(result.get(), 0);
    assert_eq!(ran_in.get().map(|id| id.get()), Some(result.get()));
    assert_eq!(back.current_routine().map(|id| id.get()), Some(result.get()));
}

#[test]
fn test_closing_caller_leaves_delegate_running() {
    let sched = Scheduler::new(SchedulerConfig::default());
    let (_watch, finished) = watch_finished(&sched);
    let container = Container::new(sched.bus());
    let main = container
        .start(true, |ctx| async move {
            ctx.delegate(|sub| async move {
                sub.wait_for(Matcher::new(WORK)).await?;
                Ok(())
            })
            .await
        })
        .unwrap();

    sched.run_until_idle();
    container.terminate(None).unwrap();
    assert_eq!(main.state(), RoutineState::Closed);
    assert_eq!(sched.listener_count(), 2);

    sched.send_event(cotask::Event::new(WORK).with("id", Value::from(1u64)));
    sched.run_until_idle();
    assert_eq!(finished.get(), 1);
    assert_eq!(sched.listener_count(), 1);
}
