//! Session Tests
//!
//! These tests drive sessions through their event loops, the way a
//! transport layer would.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use reactor_core::{EvalError, ReactiveError, RuntimeConfig, Session, SessionRegistry};

/// Input batched into one action is flushed once.
#[tokio::test]
async fn session_loop_flushes_after_each_batch() {
    let (session, task) = Session::spawn(RuntimeConfig::default()).unwrap();
    let runtime = session.runtime().clone();

    let (tx, mut rx) = mpsc::unbounded_channel();
    runtime.on_flushed(move |summary| {
        let _ = tx.send(summary.effects_run);
    });

    let a = runtime.new_cell(0);
    let b = runtime.new_cell(0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    runtime.declare_effect({
        let (a, b) = (a.clone(), b.clone());
        let seen = seen.clone();
        move |cx| {
            seen.lock().push((a.read(cx)?, b.read(cx)?));
            Ok(())
        }
    });

    // The first flush runs the new effect.
    assert_eq!(rx.recv().await, Some(1));

    session
        .request_flush(move || {
            let _ = a.write(1);
            let _ = b.write(2);
        })
        .unwrap();
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(*seen.lock(), vec![(0, 0), (1, 2)]);

    session.close();
    task.await.unwrap();
    assert!(matches!(
        session.request_flush(|| {}),
        Err(ReactiveError::SessionClosed)
    ));
}

/// Effect failures are reported through the error hooks and the loop keeps
/// serving input.
#[tokio::test]
async fn session_survives_effect_failures() {
    let (session, task) = Session::spawn(RuntimeConfig::default()).unwrap();
    let runtime = session.runtime().clone();

    let (tx, mut rx) = mpsc::unbounded_channel();
    runtime.on_error(move |node, err| {
        let _ = tx.send((node, err.to_string()));
    });

    let input = runtime.new_cell(1);
    let effect = runtime.declare_effect({
        let input = input.clone();
        move |cx| {
            if input.read(cx)? % 2 == 0 {
                return Err(EvalError::msg("even input"));
            }
            Ok(())
        }
    });

    session
        .request_flush(move || {
            let _ = input.write(2);
        })
        .unwrap();
    let (node, message) = rx.recv().await.unwrap();
    assert_eq!(node, effect.id());
    assert!(message.contains("even input"));
    assert!(!session.is_closed());

    session.close();
    task.await.unwrap();
}

/// A panicking action is contained to that action.
#[tokio::test]
async fn panicking_input_does_not_stop_the_loop() {
    let (session, task) = Session::spawn(RuntimeConfig::default()).unwrap();
    let runtime = session.runtime().clone();
    let cell = runtime.new_cell(0);

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.request_flush(|| panic!("bad message")).unwrap();
    session
        .request_flush({
            let cell = cell.clone();
            move || {
                let _ = cell.write(7);
                let _ = tx.send(());
            }
        })
        .unwrap();

    rx.recv().await.unwrap();
    assert_eq!(cell.get().unwrap(), 7);
    session.close();
    task.await.unwrap();
}

/// Timer invalidations wake the loop without any input.
#[tokio::test(start_paused = true)]
async fn timers_wake_the_session_loop() {
    let (session, task) = Session::spawn(RuntimeConfig::default()).unwrap();
    let runtime = session.runtime().clone();

    let (tx, mut rx) = mpsc::unbounded_channel();
    runtime.declare_effect(move |cx| {
        let _ = tx.send(());
        cx.invalidate_later(Duration::from_secs(1))?;
        Ok(())
    });

    for _ in 0..3 {
        rx.recv().await.unwrap();
    }
    session.close();
    task.await.unwrap();
}

/// Dropping every handle stops the loop and tears the runtime down.
#[tokio::test]
async fn loop_stops_when_handles_are_dropped() {
    let (session, task) = Session::spawn(RuntimeConfig::default()).unwrap();
    let runtime = session.runtime().clone();
    drop(session);

    task.await.unwrap();
    assert!(runtime.is_closed());
}

#[tokio::test]
async fn registry_keeps_sessions_isolated() {
    let registry = SessionRegistry::new(RuntimeConfig::default());
    let first = registry.open().unwrap();
    let second = registry.open().unwrap();
    assert_eq!(registry.len(), 2);
    assert_ne!(first.id(), second.id());

    let cell = first.runtime().new_cell(1);
    let foreign = second.runtime().declare_calc({
        let cell = cell.clone();
        move |cx| Ok(cell.read(cx)?)
    });
    assert!(matches!(
        foreign.get(),
        Err(ReactiveError::ForeignSession { node }) if node == cell.id()
    ));

    assert!(registry.close(first.id()));
    assert!(!registry.close(first.id()));
    assert!(registry.get(first.id()).is_none());
    assert!(registry.get(second.id()).is_some());
    assert!(first.is_closed());
    assert!(!second.is_closed());

    // The surviving session is untouched.
    let local = second.runtime().new_cell(5);
    assert_eq!(local.get().unwrap(), 5);

    registry.close_all();
    assert!(registry.is_empty());
    assert!(second.is_closed());
}
