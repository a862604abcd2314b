//! Behavioural tests for the forwarder bootstrap and shutdown ordering.

use std::cell::RefCell;
use std::time::Duration;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use forwarder_config::FailurePolicy;

use crate::bootstrap::Phase;
use crate::scope::CancelReason;

use super::support::{
    self, AgentScript, HealthEvent, IdentityScript, TestWorld, TransportScript,
};

type StepResult = Result<(), String>;

#[fixture]
fn world() -> RefCell<TestWorld> {
    support::world()
}

#[given("a healthy forwarder")]
fn given_healthy(world: &RefCell<TestWorld>) {
    let _ = world;
}

#[given("a dataplane agent that fails at startup")]
fn given_failing_agent(world: &RefCell<TestWorld>) {
    world.borrow_mut().use_agent(AgentScript::FailAtStart);
}

#[given("a dataplane agent that takes {millis} milliseconds to stop")]
fn given_slow_agent(world: &RefCell<TestWorld>, millis: u64) {
    world.borrow_mut().use_agent(AgentScript::Healthy {
        stop_delay: Duration::from_millis(millis),
    });
}

#[given("an identity provider that cannot obtain an SVID")]
fn given_failing_identity(world: &RefCell<TestWorld>) {
    world.borrow_mut().use_identity(IdentityScript::Unavailable);
}

#[given("an endpoint builder that fails")]
fn given_failing_endpoint(world: &RefCell<TestWorld>) {
    world.borrow_mut().use_failing_endpoint();
}

#[given("an RPC server that fails after {millis} milliseconds")]
fn given_failing_server(world: &RefCell<TestWorld>, millis: u64) {
    world
        .borrow_mut()
        .use_transport(TransportScript::FailAfter(Duration::from_millis(millis)));
}

#[given("an RPC server that cannot bind")]
fn given_unbindable_server(world: &RefCell<TestWorld>) {
    world.borrow_mut().use_transport(TransportScript::FailAtStart);
}

#[given("the failure policy is {policy}")]
fn given_policy(world: &RefCell<TestWorld>, policy: String) -> StepResult {
    let policy: FailurePolicy = policy
        .parse()
        .map_err(|error| format!("invalid policy '{policy}': {error}"))?;
    world.borrow_mut().config.failure_policy = policy;
    Ok(())
}

#[given("a configuration with an empty forwarder name")]
fn given_empty_name(world: &RefCell<TestWorld>) {
    world.borrow_mut().config.name = String::new();
}

#[when("the forwarder starts")]
fn when_starts(world: &RefCell<TestWorld>) {
    world.borrow_mut().start();
}

#[when("a termination signal arrives")]
fn when_signalled(world: &RefCell<TestWorld>) {
    world.borrow().signal();
}

#[when("the forwarder runs until shutdown")]
fn when_runs(world: &RefCell<TestWorld>) {
    world.borrow_mut().run_until_shutdown();
}

#[then("{phases} phases completed followed by {successes} startup success")]
fn then_phases_completed(world: &RefCell<TestWorld>, phases: usize, successes: usize) -> StepResult {
    let events = world.borrow().reporter.events();
    let completed: Vec<Phase> = events
        .iter()
        .filter_map(|event| match event {
            HealthEvent::PhaseCompleted(phase) => Some(*phase),
            _ => None,
        })
        .collect();
    if completed != Phase::ALL[..phases] {
        return Err(format!("unexpected phase completions: {completed:?}"));
    }
    let recorded = events
        .iter()
        .filter(|event| **event == HealthEvent::StartupCompleted)
        .count();
    if recorded != successes {
        return Err(format!("expected {successes} success events: {events:?}"));
    }
    let last_phase = events
        .iter()
        .rposition(|event| matches!(event, HealthEvent::PhaseCompleted(_)));
    let success = events
        .iter()
        .position(|event| *event == HealthEvent::StartupCompleted);
    match (last_phase, success) {
        (Some(last), Some(success)) if success > last => Ok(()),
        _ => Err(format!("startup success logged out of order: {events:?}")),
    }
}

#[then("the RPC server serves the endpoint")]
fn then_server_serves_endpoint(world: &RefCell<TestWorld>) -> StepResult {
    let world = world.borrow();
    let served = world.transport.served();
    let [(endpoint, services)] = served.as_slice() else {
        return Err(format!("expected one server, got {served:?}"));
    };
    if endpoint != world.config.listen_on() {
        return Err(format!("server bound {endpoint} instead of {}", world.config.listen_on()));
    }
    if world.endpoint.built() != vec![world.config.name.clone()] {
        return Err(format!("endpoint builds: {:?}", world.endpoint.built()));
    }
    if services.len() != 1 {
        return Err(format!("expected exactly one registered service: {services:?}"));
    }
    Ok(())
}

#[then("the forwarder stopped because of a termination signal")]
fn then_stopped_by_signal(world: &RefCell<TestWorld>) -> StepResult {
    let world = world.borrow();
    let report = world.report().ok_or("forwarder did not stop")?;
    if *report.reason() != CancelReason::Signal {
        return Err(format!("stopped because {}", report.reason()));
    }
    if !report.is_success() {
        return Err(format!("unexpected failures: {:?}", report.failures()));
    }
    Ok(())
}

#[then("the {subsystem} failure cancelled the forwarder")]
fn then_failure_cancelled(world: &RefCell<TestWorld>, subsystem: String) -> StepResult {
    let world = world.borrow();
    let report = world.report().ok_or("forwarder did not stop")?;
    let expected = CancelReason::SubsystemFailed {
        subsystem: subsystem.clone(),
    };
    if *report.reason() != expected {
        return Err(format!("stopped because {}", report.reason()));
    }
    let logged = world.reporter.count(|event| {
        *event
            == HealthEvent::SubsystemFailed {
                subsystem: subsystem.clone(),
            }
    });
    if logged != 1 {
        return Err(format!("failure logged {logged} times"));
    }
    Ok(())
}

#[then("the dataplane agent stopped before the forwarder returned")]
fn then_agent_stopped(world: &RefCell<TestWorld>) -> StepResult {
    if world.borrow().agent.stopped() {
        Ok(())
    } else {
        Err("forwarder returned while the agent was still running".to_owned())
    }
}

#[then("the dataplane agent was never started")]
fn then_agent_never_started(world: &RefCell<TestWorld>) -> StepResult {
    match world.borrow().agent.starts() {
        0 => Ok(()),
        starts => Err(format!("agent started {starts} times")),
    }
}

#[then("no RPC server was started")]
fn then_no_server(world: &RefCell<TestWorld>) -> StepResult {
    let served = world.borrow().transport.served();
    if served.is_empty() {
        Ok(())
    } else {
        Err(format!("servers started: {served:?}"))
    }
}

#[then("bootstrap fails in phase {phase}")]
fn then_bootstrap_fails(world: &RefCell<TestWorld>, phase: u8) -> StepResult {
    let world = world.borrow();
    let error = world
        .bootstrap_error()
        .ok_or("bootstrap succeeded unexpectedly")?;
    if error.phase().number() != phase {
        return Err(format!("failed in phase {}: {error}", error.phase().number()));
    }
    let reported = world.reporter.count(|event| {
        matches!(event, HealthEvent::StartupFailed { phase: failed, .. } if failed.number() == phase)
    });
    if reported != 1 {
        return Err(format!("startup failure reported {reported} times"));
    }
    if world.reporter.count(|event| *event == HealthEvent::StartupCompleted) != 0 {
        return Err("startup success was logged".to_owned());
    }
    Ok(())
}

#[then("the process exits successfully")]
fn then_exit_success(world: &RefCell<TestWorld>) -> StepResult {
    match world.borrow().exit_failed() {
        Some(false) => Ok(()),
        Some(true) => Err("process would exit with a failure".to_owned()),
        None => Err("forwarder has not finished".to_owned()),
    }
}

#[then("the process exits with a failure")]
fn then_exit_failure(world: &RefCell<TestWorld>) -> StepResult {
    match world.borrow().exit_failed() {
        Some(true) => Ok(()),
        Some(false) => Err("process would exit successfully".to_owned()),
        None => Err("forwarder has not finished".to_owned()),
    }
}

#[scenario(path = "tests/features/forwarder_bootstrap.feature")]
fn forwarder_bootstrap_scenarios(#[from(world)] world: RefCell<TestWorld>) {
    drop(world);
}
