//! End-to-end bracket scenarios driven through the dispatcher.

use flux_core::{ActionId, Flux, FluxError, Plugin};
use flux_testing::{Behavior, RecordingHandler, TraceLog, TracePlugin};
use serde_json::json;
use std::rc::Rc;

const ONE: ActionId = ActionId::new(1);
const TWO: ActionId = ActionId::new(2);
const THREE: ActionId = ActionId::new(3);

#[test]
fn three_plugins_nest_as_brackets() {
    let flux = Flux::new();
    let container = flux.container();
    let log = TraceLog::new();

    container.wrap(ONE, TracePlugin::new("C", Behavior::Finish, &log));
    container.wrap(ONE, TracePlugin::new("D", Behavior::Finish, &log));
    container.wrap(ONE, TracePlugin::new("E", Behavior::Finish, &log));
    flux.dispatcher().dispatch_action(ONE, &[json!("X")]).unwrap();

    assert_eq!(
        log.trace(),
        "(1:r-E-X)(1:r-D-X)(1:r-C-X)(1:f-C)(1:f-D)(1:f-E)"
    );
}

#[test]
fn aborting_middle_plugin_never_runs_the_inner_one() {
    let flux = Flux::new();
    let container = flux.container();
    let log = TraceLog::new();

    container.wrap(ONE, TracePlugin::new("C", Behavior::Finish, &log));
    container.wrap(ONE, TracePlugin::new("D", Behavior::Abort, &log));
    container.wrap(ONE, TracePlugin::new("E", Behavior::Finish, &log));
    flux.dispatcher().dispatch_action(ONE, &[json!("X")]).unwrap();

    assert_eq!(log.trace(), "(1:r-E-X)(1:r-D-X)(1:a-D)(1:a-E)");
    assert!(!log.trace().contains("r-C"));
}

#[test]
fn every_wrap_order_runs_in_reverse_and_finishes_in_order() {
    let orders = [
        ["A", "B", "C"],
        ["A", "C", "B"],
        ["B", "A", "C"],
        ["B", "C", "A"],
        ["C", "A", "B"],
        ["C", "B", "A"],
    ];

    for order in orders {
        let flux = Flux::new();
        let container = flux.container();
        let log = TraceLog::new();
        for name in order {
            container.wrap(ONE, TracePlugin::new(name, Behavior::Finish, &log));
        }

        flux.dispatcher().dispatch_action(ONE, &[json!("X")]).unwrap();

        let expected: String = order
            .iter()
            .rev()
            .map(|n| format!("(1:r-{n}-X)"))
            .chain(order.iter().map(|n| format!("(1:f-{n})")))
            .collect();
        assert_eq!(log.trace(), expected, "wrap order {order:?}");
    }
}

#[test]
fn random_holds_never_finish_outer_before_inner() {
    for _ in 0..64 {
        let flux = Flux::new();
        let container = flux.container();
        let log = TraceLog::new();

        let plugins: Vec<Rc<TracePlugin>> = (0..5)
            .map(|i| {
                let behavior = if fastrand::bool() {
                    Behavior::Hold
                } else {
                    Behavior::Finish
                };
                TracePlugin::new(format!("P{i}"), behavior, &log)
            })
            .collect();
        for plugin in &plugins {
            container.wrap(ONE, plugin.clone());
        }

        flux.dispatcher().dispatch_action(ONE, &[json!("X")]).unwrap();

        let mut held: Vec<&Rc<TracePlugin>> =
            plugins.iter().filter(|p| !p.held().is_empty()).collect();
        fastrand::shuffle(&mut held);
        for plugin in held {
            plugin.release().unwrap();
        }

        // Wrap order is innermost first, so finishes must follow it exactly.
        let finishes: Vec<String> = log
            .entries()
            .into_iter()
            .filter(|e| e.contains(":f-"))
            .collect();
        let expected: Vec<String> = plugins
            .iter()
            .map(|p| format!("(1:f-{})", p.name()))
            .collect();
        assert_eq!(finishes, expected);
        assert!(!container.is_running(ONE));
    }
}

#[test]
fn hold_blocks_redispatch_and_release_is_single_use() {
    let flux = Flux::new();
    let container = flux.container();
    let log = TraceLog::new();
    let held = TracePlugin::new("H", Behavior::Hold, &log);
    container.wrap(ONE, held.clone());

    flux.dispatcher().dispatch_action(ONE, &[json!("X")]).unwrap();
    assert!(matches!(
        flux.dispatcher().dispatch_action(ONE, &[json!("X")]),
        Err(FluxError::Reentrant { .. })
    ));

    held.release().unwrap();
    let err = held.release().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FluxError>(),
        Some(FluxError::DoubleCompletion { .. })
    ));

    // Other actions are unaffected by a held one.
    container.wrap(TWO, TracePlugin::new("T", Behavior::Finish, &log));
    flux.dispatcher().dispatch_action(TWO, &[json!("Y")]).unwrap();
    assert!(log.trace().ends_with("(2:r-T-Y)(2:f-T)"));
}

#[test]
fn held_plugin_can_be_released_from_a_later_dispatch() {
    let flux = Flux::new();
    let container = flux.container();
    let log = TraceLog::new();
    let held = TracePlugin::new("H", Behavior::Hold, &log);
    container.wrap(ONE, held.clone());

    let releaser = held.clone();
    flux.dispatcher().subscribe_fn(TWO, move |_, _| releaser.release());

    flux.dispatcher().dispatch_action(ONE, &[json!("X")]).unwrap();
    assert!(container.is_running(ONE));

    flux.dispatcher().dispatch_action(TWO, &[]).unwrap();
    assert_eq!(log.trace(), "(1:r-H-X)(1:f-H)");
    assert!(!container.is_running(ONE));
}

#[test]
fn wildcard_fires_only_for_actions_without_specific_plugins() {
    let flux = Flux::new();
    let container = flux.container();
    let log = TraceLog::new();

    container.wrap(ActionId::ANY, TracePlugin::new("W", Behavior::Finish, &log));
    container.wrap(TWO, TracePlugin::new("S", Behavior::Finish, &log));

    flux.dispatcher().dispatch_action(ONE, &[json!("a")]).unwrap();
    flux.dispatcher().dispatch_action(THREE, &[json!("c")]).unwrap();
    assert_eq!(log.trace(), "(1:r-W-a)(1:f-W)(3:r-W-c)(3:f-W)");

    log.clear();
    flux.dispatcher().dispatch_action(TWO, &[json!("b")]).unwrap();
    assert_eq!(log.entries().iter().filter(|e| e.contains("r-W")).count(), 1);
}

#[test]
fn dispatcher_wildcard_handlers_run_after_specific_ones() {
    let flux = Flux::new();
    let log = TraceLog::new();
    let dispatcher = flux.dispatcher();

    dispatcher.subscribe_action(ActionId::ANY, RecordingHandler::create("any", &log), None);
    dispatcher.subscribe_action(ONE, RecordingHandler::create("one", &log), None);
    dispatcher.dispatch_action(ONE, &[]).unwrap();
    dispatcher.dispatch_action(TWO, &[]).unwrap();

    assert_eq!(log.trace(), "(1:h-one)(1:h-any)(2:h-any)");
}

#[test]
fn configure_resolves_every_spec_kind() {
    use flux_core::PluginSpec;

    let flux = Flux::new();
    let container = flux.container();
    let log = TraceLog::new();

    let fn_log = log.clone();
    let factory_log = log.clone();
    let resolved = container.configure([
        (
            ONE,
            PluginSpec::Instance(TracePlugin::new("I", Behavior::Finish, &log) as Rc<dyn Plugin>),
        ),
        (
            ONE,
            PluginSpec::Factory(Rc::new(move || {
                TracePlugin::new("F", Behavior::Finish, &factory_log) as Rc<dyn Plugin>
            })),
        ),
        (
            ONE,
            PluginSpec::function(move |_, _, action, _| {
                fn_log.push(format!("({action}:r-fn)"));
                Ok(())
            }),
        ),
    ]);
    assert_eq!(resolved.len(), 3);

    flux.dispatcher().dispatch_action(ONE, &[json!("X")]).unwrap();
    assert_eq!(
        log.trace(),
        "(1:r-fn)(1:r-F-X)(1:r-I-X)(1:f-I)(1:f-F)"
    );
}
