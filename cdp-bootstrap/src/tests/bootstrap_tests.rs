use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::fakes::{eventually, shortcut, FakeProcess, Harness, PORT, START_MS};
use crate::bootstrap::EnvironmentState;
use crate::conductor::RelaunchAction;
use crate::entry::{required_flag, EntryKind};
use crate::host::{Indicator, MessageLevel};
use crate::markers::keys;

#[tokio::test]
async fn first_run_patches_marks_and_relaunches() {
    let harness = Harness::new(vec![shortcut("Cursor.lnk", EntryKind::StartMenu, "")]);
    let session = harness.session();

    let report = session.bootstrap().await;

    assert_eq!(report.state, EnvironmentState::UnreachableFirstRun);
    assert!(report.exiting);
    assert_eq!(report.repair.as_ref().unwrap().modified, 1);
    assert_eq!(report.relaunch.as_ref().unwrap().action, RelaunchAction::Relaunched);
    assert!(harness.environment.stored()[0].has_required_flag);
    assert!(session.markers().load().await.registry_configured);
    assert_eq!(harness.process.spawned().len(), 1);
    assert_eq!(harness.environment.prepared().len(), 1);
    assert!(!session.is_polling());
}

#[tokio::test]
async fn first_run_skips_the_relaunch_when_the_port_opens_meanwhile() {
    let harness = Harness::new(vec![shortcut("Cursor.lnk", EntryKind::StartMenu, "")]);
    harness.probe.open_after(1);
    let session = harness.session();

    let report = session.bootstrap().await;

    assert_eq!(report.state, EnvironmentState::Available);
    assert!(!report.exiting);
    assert_eq!(report.relaunch.as_ref().unwrap().action, RelaunchAction::None);
    assert!(harness.environment.stored()[0].has_required_flag);
    assert!(session.markers().load().await.registry_configured);
    assert!(harness.process.spawned().is_empty());
    assert!(harness.environment.prepared().is_empty());
    assert_eq!(harness.probe.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn first_run_failure_leaves_the_feature_off_with_a_manual_fix() {
    let mut harness = Harness::new(vec![]);
    harness.process = Arc::new(FakeProcess::default());
    harness.set(keys::ENABLED, true).await;
    let session = harness.session();

    let report = session.bootstrap().await;

    assert_eq!(report.state, EnvironmentState::UnreachableConnectionLimited);
    assert!(!report.exiting);
    assert!(report.connection_limited);
    assert!(!session.state().enabled);
    assert!(!session.is_polling());
    assert_eq!(session.current_indicator(), Indicator::ConnectionLimited);

    let flag = required_flag(PORT);
    assert!(
        eventually(|| !harness.shell.messages_containing(&flag).is_empty()).await,
        "manual-fix message naming the flag"
    );
    assert_eq!(harness.shell.messages_containing(&flag)[0].0, MessageLevel::Warning);
}

#[tokio::test]
async fn already_configured_and_reachable_does_nothing() {
    let harness = Harness::new(vec![shortcut(
        "Cursor.lnk",
        EntryKind::StartMenu,
        "--remote-debugging-port=9000",
    )]);
    harness.set(keys::REGISTRY_CONFIGURED, true).await;
    harness.probe.set_reachable(true);
    let session = harness.session();

    let report = session.bootstrap().await;

    assert_eq!(report.state, EnvironmentState::Available);
    assert!(report.relaunch.is_none());
    assert_eq!(harness.environment.patch_calls(), 0);
    assert!(harness.process.spawned().is_empty());
    assert_eq!(harness.shell.last_indicator(), Some(Indicator::Disabled));
}

#[tokio::test]
async fn reachable_port_marks_the_registry_configured() {
    let harness = Harness::new(vec![]);
    harness.probe.set_reachable(true);
    let session = harness.session();

    session.bootstrap().await;

    assert!(session.markers().load().await.registry_configured);
}

#[tokio::test(start_paused = true)]
async fn enabled_session_self_heals_without_relaunching() {
    let harness = Harness::new(vec![shortcut("Cursor.lnk", EntryKind::Desktop, "")]);
    harness.set(keys::ENABLED, true).await;
    harness.probe.set_reachable(true);
    let session = harness.session();

    let report = session.bootstrap().await;
    assert_eq!(report.state, EnvironmentState::Available);
    assert!(session.is_polling());
    assert_eq!(harness.environment.patch_calls(), 0);

    tokio::time::sleep(harness.config.self_heal_delay() + Duration::from_millis(10)).await;

    assert_eq!(harness.environment.patch_calls(), 1);
    assert!(harness.environment.stored()[0].has_required_flag);
    assert!(harness.process.spawned().is_empty());
    session.shutdown().await;
}

#[tokio::test]
async fn skipped_setup_never_prompts_or_repairs() {
    let harness = Harness::new(vec![shortcut("Cursor.lnk", EntryKind::StartMenu, "")]);
    harness.set(keys::SKIP_PROMPT, true).await;
    let session = harness.session();

    let report = session.bootstrap().await;

    assert_eq!(report.state, EnvironmentState::UnreachableUserSkipped);
    assert_eq!(harness.environment.locate_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.shell.prompts(), 0);
    assert!(harness.process.spawned().is_empty());
    assert_eq!(session.current_indicator(), Indicator::LimitedMode);
}

#[tokio::test]
async fn configured_registry_outranks_a_declined_prompt() {
    let harness = Harness::new(vec![shortcut("Cursor.lnk", EntryKind::StartMenu, "")]);
    harness.set(keys::SKIP_PROMPT, true).await;
    harness.set(keys::REGISTRY_CONFIGURED, true).await;
    let session = harness.session();

    let report = session.bootstrap().await;

    assert_eq!(report.state, EnvironmentState::UnreachableRegistryStaleOrBypassed);
    assert!(report.exiting);
    assert_eq!(harness.process.spawned().len(), 1);
    assert_eq!(session.markers().load().await.last_auto_relaunch_ms, START_MS);
    assert_eq!(harness.shell.prompts(), 0);

    // a second start inside the cooldown stays put
    harness.environment.reset_entries(vec![shortcut("Cursor.lnk", EntryKind::StartMenu, "")]);
    let again = session.bootstrap().await;
    assert!(!again.exiting);
    assert!(again.connection_limited);
    assert_eq!(harness.process.spawned().len(), 1);
}

#[tokio::test]
async fn automatic_relaunches_respect_the_cooldown() {
    let unflagged = || vec![shortcut("Cursor.lnk", EntryKind::StartMenu, "")];
    let harness = Harness::new(unflagged());
    harness.set(keys::REGISTRY_CONFIGURED, true).await;
    let session = harness.session();

    let first = session.bootstrap().await;
    assert!(first.exiting);
    assert_eq!(session.markers().load().await.last_auto_relaunch_ms, START_MS);
    assert_eq!(harness.process.spawned().len(), 1);

    // the host reset its shortcut again
    harness.environment.reset_entries(unflagged());
    harness.clock.advance(harness.config.relaunch_cooldown_ms - 1);

    let second = session.bootstrap().await;
    assert_eq!(second.state, EnvironmentState::UnreachableRegistryStaleOrBypassed);
    assert!(second.connection_limited);
    assert!(!second.exiting);
    assert_eq!(harness.process.spawned().len(), 1);
    assert_eq!(session.current_indicator(), Indicator::ConnectionLimited);

    harness.clock.advance(1);
    let third = session.bootstrap().await;
    assert!(third.exiting);
    assert_eq!(harness.process.spawned().len(), 2);

    let stamp = session.markers().load().await.last_auto_relaunch_ms;
    assert!(stamp - START_MS >= 180_000);
}

#[tokio::test]
async fn nothing_to_repair_means_no_automatic_relaunch() {
    let harness = Harness::new(vec![shortcut(
        "Cursor.lnk",
        EntryKind::StartMenu,
        "--remote-debugging-port=9000",
    )]);
    harness.set(keys::REGISTRY_CONFIGURED, true).await;
    let session = harness.session();

    let report = session.bootstrap().await;

    assert_eq!(report.state, EnvironmentState::UnreachableRegistryStaleOrBypassed);
    assert!(report.connection_limited);
    assert_eq!(report.repair.as_ref().unwrap().modified, 0);
    assert!(report.relaunch.is_none());
    assert!(harness.process.spawned().is_empty());
    // the attempt is stamped even though nothing was relaunched
    assert_eq!(session.markers().load().await.last_auto_relaunch_ms, START_MS);
}

#[tokio::test]
async fn connection_limited_is_reset_by_the_next_pass() {
    let harness = Harness::new(vec![]);
    harness.set(keys::REGISTRY_CONFIGURED, true).await;
    harness.set(keys::LAST_AUTO_RELAUNCH, START_MS).await;
    let session = harness.session();

    assert!(session.bootstrap().await.connection_limited);
    assert!(session.state().connection_limited);

    harness.probe.set_reachable(true);
    let report = session.bootstrap().await;
    assert_eq!(report.state, EnvironmentState::Available);
    assert!(!session.state().connection_limited);
    assert_eq!(session.current_indicator(), Indicator::Disabled);
}
