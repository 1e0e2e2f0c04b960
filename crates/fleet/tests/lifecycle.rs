//! Lifecycle controller behaviour against fake collaborators.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::{collections::HashSet, sync::atomic::Ordering, time::Duration};

use {
    chrono::{TimeZone, Utc},
    common::{ADMIN, ALICE, BOB, harness, harness_with},
    deskfarm_fleet::{
        ControllerSettings, Credentials, Error, QuotaSpec, instance_name,
        launch::{LABEL_MANAGED, LABEL_OWNER, LABEL_QUOTA},
    },
    rstest::rstest,
    secrecy::ExposeSecret,
    tokio_util::sync::CancellationToken,
};

fn creds() -> Credentials {
    Credentials::new("alice", "s3cret!")
}

fn hours(n: i64) -> chrono::Duration {
    chrono::Duration::hours(n)
}

#[rstest]
#[case(QuotaSpec::new(4, 4, 400, 100))]
#[case(QuotaSpec::new(1, 1, 1, 0))]
#[case(QuotaSpec::new(64, 32, 2000, 500))]
#[tokio::test]
async fn deploy_records_the_requested_quota(#[case] quota: QuotaSpec) {
    let h = harness();
    h.controller.set_defaults(quota).unwrap();

    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();

    assert_eq!(record.quota, quota);
    assert_eq!(record.owner, ALICE);
    assert_eq!(record.id, instance_name("win", ALICE));
    assert_eq!(h.controller.registry().len(), 1);
    assert_eq!(h.controller.registry().get(&record.id).unwrap(), record);
    assert!(h.runtime.has(&record.id));
}

#[tokio::test]
async fn default_preset_maps_to_runtime_env() {
    let h = harness();
    h.controller
        .set_defaults(QuotaSpec::new(4, 4, 400, 100))
        .unwrap();
    h.controller.deploy(ALICE, &creds(), None).await.unwrap();

    let spec = h.runtime.last_spec().unwrap();
    assert_eq!(spec.env["RAM_SIZE"], "4G");
    assert_eq!(spec.env["CPU_CORES"], "4");
    assert_eq!(spec.env["DISK_SIZE"], "400G");
    assert_eq!(spec.env["DISK2_SIZE"], "100G");
    assert_eq!(spec.env["USERNAME"], "alice");
    assert_eq!(spec.secret_env["PASSWORD"].expose_secret(), "s3cret!");
}

#[tokio::test]
async fn promo_code_grant_overrides_defaults() {
    let h = harness();
    let promo = h
        .controller
        .issue_promo(QuotaSpec::new(16, 8, 800, 200))
        .unwrap();

    let record = h
        .controller
        .deploy(ALICE, &creds(), Some(&promo.code.to_lowercase()))
        .await
        .unwrap();

    assert_eq!(record.quota, QuotaSpec::new(16, 8, 800, 200));
    assert_eq!(h.runtime.last_spec().unwrap().env["RAM_SIZE"], "16G");
}

#[tokio::test]
async fn unknown_promo_code_touches_nothing() {
    let h = harness();
    let err = h
        .controller
        .deploy(ALICE, &creds(), Some("ZZZZZZ"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownPromoCode(_)));
    assert_eq!(h.runtime.creates(), 0);
    assert!(h.controller.registry().is_empty());
}

#[tokio::test]
async fn unauthorized_deploy_never_reaches_runtime() {
    let h = harness();
    let err = h
        .controller
        .deploy("intruder", &creds(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));
    assert!(h.controller.registry().is_empty());
    assert_eq!(h.runtime.creates(), 0);
}

#[tokio::test]
async fn empty_allowlist_denies_deploy() {
    let h = harness_with(deskfarm_config::DeskfarmConfig::default(), None);
    let err = h.controller.deploy(ADMIN, &creds(), None).await.unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));
    assert_eq!(h.runtime.creates(), 0);
}

#[tokio::test]
async fn invalid_credentials_fail_before_runtime() {
    let h = harness();
    let err = h
        .controller
        .deploy(ALICE, &Credentials::new("alice", "   "), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCredentials(_)));
    assert_eq!(h.runtime.creates(), 0);
}

#[tokio::test]
async fn create_failure_leaves_registry_unchanged() {
    let h = harness();
    h.runtime.fail_create("image pull failed");

    let err = h.controller.deploy(ALICE, &creds(), None).await.unwrap_err();

    assert!(matches!(err, Error::Runtime(_)));
    assert!(err.to_string().contains("image pull failed"));
    assert!(!err.user_message().contains("image pull failed"));
    assert!(h.controller.registry().is_empty());
    assert_eq!(h.tunnels.open_count(), 0);
    // Best-effort cleanup by name.
    assert_eq!(h.runtime.remove_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_deploy_releases_the_reservation() {
    let h = harness();
    h.runtime.fail_create("daemon unavailable");
    assert!(h.controller.deploy(ALICE, &creds(), None).await.is_err());
    assert!(h.controller.registry().reserve(&instance_name("win", ALICE)).is_ok());
}

#[tokio::test(start_paused = true)]
async fn timed_out_create_is_compensated() {
    let mut settings = ControllerSettings::default();
    settings.call_timeout = Duration::from_secs(5);
    let h = harness_with(common::config(), Some(settings));
    h.runtime.delay_create(Duration::from_secs(600));

    let err = h.controller.deploy(ALICE, &creds(), None).await.unwrap_err();

    assert!(matches!(err, Error::Timeout {
        operation: "create",
        ..
    }));
    assert!(h.controller.registry().is_empty());
    let name = instance_name("win", ALICE);
    assert!(!h.runtime.has(&name), "partial container must be removed");
}

#[tokio::test]
async fn name_conflict_leaves_foreign_container_alone() {
    let h = harness();
    let name = instance_name("win", ALICE);
    h.runtime.add_foreign(&name);

    let err = h.controller.deploy(ALICE, &creds(), None).await.unwrap_err();

    assert!(matches!(err, Error::DuplicateInstance(_)));
    assert_eq!(h.runtime.remove_calls.load(Ordering::SeqCst), 0);
    assert!(h.controller.registry().is_empty());
}

#[tokio::test]
async fn second_deploy_for_same_owner_is_rejected() {
    let h = harness();
    h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    let err = h.controller.deploy(ALICE, &creds(), None).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateInstance(_)));
    assert_eq!(h.runtime.creates(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_owner_deploys_yield_one_instance() {
    let h = harness();
    h.runtime.delay_create(Duration::from_millis(50));
    let c = creds();

    let (a, b) = tokio::join!(
        h.controller.deploy(ALICE, &c, None),
        h.controller.deploy(ALICE, &c, None)
    );

    let ok = [a.is_ok(), b.is_ok()].iter().filter(|x| **x).count();
    assert_eq!(ok, 1);
    assert!(matches!(
        a.err().or(b.err()),
        Some(Error::DuplicateInstance(_))
    ));
    assert_eq!(h.controller.registry().len(), 1);
    assert_eq!(h.runtime.creates(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_owners_get_distinct_ids() {
    let mut config = common::config();
    let owners: Vec<String> = (0..16).map(|i| format!("user-{i}")).collect();
    config.access.allowlist.extend(owners.iter().cloned());
    let h = harness_with(config, None);

    let c = creds();
    let results =
        futures::future::join_all(owners.iter().map(|o| h.controller.deploy(o, &c, None))).await;

    let ids: HashSet<String> = results.into_iter().map(|r| r.unwrap().id).collect();
    assert_eq!(ids.len(), owners.len());
    assert_eq!(h.controller.registry().len(), owners.len());
}

#[tokio::test]
async fn single_use_promo_is_restored_when_deploy_fails() {
    let mut config = common::config();
    config.promo.redemption = "single-use".into();
    let h = harness_with(config, None);
    let promo = h.controller.issue_promo(QuotaSpec::new(8, 4, 100, 0)).unwrap();

    h.runtime.fail_create("no space left on device");
    assert!(
        h.controller
            .deploy(ALICE, &creds(), Some(&promo.code))
            .await
            .is_err()
    );

    // Still redeemable once.
    assert_eq!(
        h.controller.catalog().redeem(&promo.code).unwrap(),
        promo.grant
    );
    assert!(matches!(
        h.controller.catalog().redeem(&promo.code),
        Err(Error::UnknownPromoCode(_))
    ));
}

#[tokio::test]
async fn list_active_shows_only_own_instances() {
    let h = harness();
    let a = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.controller.deploy(BOB, &creds(), None).await.unwrap();

    let listed = h.controller.list_active(ALICE).await.unwrap();
    assert_eq!(listed, vec![a]);
    assert!(h.controller.list_active("nobody").await.unwrap().is_empty());
}

#[tokio::test]
async fn externally_removed_instance_drops_out_after_one_pass() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.controller.open_tunnel(&record.id, 3389).await.unwrap();

    h.runtime.vanish(&record.id);

    assert!(h.controller.list_active(ALICE).await.unwrap().is_empty());
    assert!(!h.controller.registry().contains(&record.id));
    assert_eq!(h.tunnels.closed(), vec!["tun-0".to_string()]);
}

#[tokio::test]
async fn reconcile_counts_dropped_records() {
    let h = harness();
    let a = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.controller.deploy(BOB, &creds(), None).await.unwrap();
    h.runtime.vanish(&a.id);

    assert_eq!(h.controller.reconcile().await.unwrap(), 1);
    assert_eq!(h.controller.reconcile().await.unwrap(), 0);
    assert_eq!(h.controller.registry().len(), 1);
}

#[tokio::test]
async fn adopts_managed_containers_after_restart() {
    let h = harness();
    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
    let name = instance_name("win", ALICE);
    h.runtime.seed(
        &name,
        &[
            (LABEL_MANAGED, "true"),
            (LABEL_OWNER, ALICE),
            (LABEL_QUOTA, "8,2,64,0"),
        ],
        t0,
    );
    h.runtime
        .seed("unlabelled", &[(LABEL_MANAGED, "true")], t0);
    h.runtime.seed("someone-else", &[("app", "db")], t0);

    assert_eq!(h.controller.adopt_existing().await.unwrap(), 1);
    assert_eq!(h.controller.adopt_existing().await.unwrap(), 0);

    let record = h.controller.registry().get(&name).unwrap();
    assert_eq!(record.owner, ALICE);
    assert_eq!(record.quota, QuotaSpec::new(8, 2, 64, 0));
    assert_eq!(record.created_at, t0);

    // The adopted instance blocks a fresh deploy for the same owner.
    let err = h.controller.deploy(ALICE, &creds(), None).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateInstance(_)));
}

#[tokio::test]
async fn adopted_without_quota_label_gets_defaults() {
    let h = harness();
    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
    h.runtime
        .seed("win_legacy", &[(LABEL_MANAGED, "true"), (LABEL_OWNER, BOB)], t0);
    h.controller.adopt_existing().await.unwrap();
    assert_eq!(
        h.controller.registry().get("win_legacy").unwrap().quota,
        h.controller.catalog().defaults()
    );
}

#[tokio::test]
async fn reclaims_expired_instance_and_closes_tunnels() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    let binding = h.controller.open_tunnel(&record.id, 3389).await.unwrap();
    let t0 = record.created_at;

    let early = h.controller.reclaim_expired(hours(8), t0 + hours(7)).await;
    assert_eq!(early.count(), 0);

    let report = h.controller.reclaim_expired(hours(8), t0 + hours(9)).await;

    assert_eq!(report.count(), 1);
    assert_eq!(report.removed, vec![record.id.clone()]);
    assert!(report.failures.is_empty());
    assert_eq!(h.tunnels.closed(), vec![binding.tunnel_id]);
    assert!(!h.runtime.has(&record.id));
    assert!(h.controller.registry().is_empty());
}

#[tokio::test]
async fn reclaim_twice_never_repeats_an_instance() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    let later = record.created_at + hours(9);

    let first = h.controller.reclaim_expired(hours(8), later).await;
    let second = h.controller.reclaim_expired(hours(8), later).await;

    assert_eq!(first.count(), 1);
    assert_eq!(second.count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reclaims_split_the_work() {
    let h = harness();
    let a = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.controller.deploy(BOB, &creds(), None).await.unwrap();
    let later = a.created_at + hours(24);

    let (r1, r2) = tokio::join!(
        h.controller.reclaim_expired(hours(8), later),
        h.controller.reclaim_expired(hours(8), later)
    );

    let mut all: Vec<String> = r1.removed.into_iter().chain(r2.removed).collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 2);
    assert_eq!(h.runtime.remove_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_removal_is_retried_next_pass() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    let later = record.created_at + hours(9);
    h.runtime.fail_remove(&record.id);

    let report = h.controller.reclaim_expired(hours(8), later).await;
    assert_eq!(report.count(), 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, record.id);
    assert!(h.controller.registry().contains(&record.id));

    h.runtime.heal_remove(&record.id);
    let retry = h.controller.reclaim_expired(hours(8), later).await;
    assert_eq!(retry.removed, vec![record.id]);
}

#[tokio::test]
async fn one_failure_does_not_abort_the_batch() {
    let h = harness();
    let a = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    let b = h.controller.deploy(BOB, &creds(), None).await.unwrap();
    h.runtime.fail_remove(&a.id);

    let report = h
        .controller
        .reclaim_expired(hours(8), a.created_at + hours(9))
        .await;

    assert_eq!(report.removed, vec![b.id]);
    assert_eq!(report.failures.len(), 1);
}

#[tokio::test]
async fn node_stats_ranks_by_cpu_then_id() {
    let mut config = common::config();
    let owners: Vec<String> = (0..7).map(|i| format!("u{i}")).collect();
    config.access.allowlist.extend(owners.iter().cloned());
    let h = harness_with(config, None);

    let cpu = [10.0, 90.0, 50.0, 50.0, 5.0, 70.0, 1.0];
    let mut ids = Vec::new();
    for (owner, cpu) in owners.iter().zip(cpu) {
        let record = h.controller.deploy(owner, &creds(), None).await.unwrap();
        h.runtime.set_usage(&record.id, cpu, 10.0);
        ids.push(record.id);
    }
    // One instance without stats is skipped.
    let extra = h.controller.deploy(ALICE, &creds(), None).await.unwrap();

    let stats = h.controller.node_stats().await.unwrap();

    assert!((stats.cpu_percent - 37.5).abs() < f64::EPSILON);
    assert!((stats.ram_percent - 62.0).abs() < f64::EPSILON);
    assert_eq!(stats.top.len(), 5);
    assert!(stats.top.iter().all(|u| u.id != extra.id));

    let cpus: Vec<f64> = stats.top.iter().map(|u| u.cpu_percent).collect();
    assert_eq!(cpus, vec![90.0, 70.0, 50.0, 50.0, 10.0]);
    let (first, second) = (&stats.top[2].id, &stats.top[3].id);
    assert!(first < second, "ties are broken by id");
    let mut tied = vec![ids[2].clone(), ids[3].clone()];
    tied.sort();
    assert_eq!(vec![first.clone(), second.clone()], tied);
}

#[tokio::test]
async fn tunnel_uses_published_host_port() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.runtime.publish(&record.id, 3389, 49153);

    let binding = h.controller.open_tunnel(&record.id, 3389).await.unwrap();

    assert_eq!(binding.container_port, 3389);
    assert_eq!(binding.local_port, 49153);
    assert_eq!(h.tunnels.local_port_of(&binding.tunnel_id), Some(49153));
    assert!((1000..=9999).contains(&binding.advertised_port));
    assert_eq!(h.controller.tunnels(&record.id).unwrap(), vec![binding]);
}

#[tokio::test]
async fn tunnel_for_unknown_instance_is_rejected() {
    let h = harness();
    let err = h.controller.open_tunnel("win_ghost", 3389).await.unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound(_)));
    assert_eq!(h.tunnels.open_count(), 0);
}

#[tokio::test]
async fn tunnel_port_zero_is_rejected() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    let err = h.controller.open_tunnel(&record.id, 0).await.unwrap_err();
    assert!(matches!(err, Error::TunnelProvider(_)));
}

#[tokio::test]
async fn tunnel_provider_failure_records_nothing() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.tunnels.fail_open();
    let err = h.controller.open_tunnel(&record.id, 3389).await.unwrap_err();
    assert!(matches!(err, Error::TunnelProvider(_)));
    assert!(h.controller.tunnels(&record.id).unwrap().is_empty());
}

#[tokio::test]
async fn close_tunnels_detaches_all_bindings() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.controller.open_tunnel(&record.id, 3389).await.unwrap();
    h.controller.open_tunnel(&record.id, 8006).await.unwrap();

    assert_eq!(h.controller.close_tunnels(&record.id).await.unwrap(), 2);
    assert!(h.controller.tunnels(&record.id).unwrap().is_empty());
    assert_eq!(h.tunnels.open_count(), 0);
    assert!(matches!(
        h.controller.close_tunnels("win_ghost").await,
        Err(Error::InstanceNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn maintenance_loop_reclaims_and_stops() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    let cancel = CancellationToken::new();

    // A negative TTL makes every instance expired on the first tick.
    let handle = h.controller.spawn_maintenance(
        Duration::from_secs(60),
        chrono::Duration::seconds(-1),
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(!h.controller.registry().contains(&record.id));
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn unpublished_port_is_never_tunnelled() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();

    // 22 is not in the published set, so the host's own sshd would be exposed.
    let err = h.controller.open_tunnel(&record.id, 22).await.unwrap_err();
    assert!(matches!(err, Error::TunnelProvider(_)));
    assert_eq!(h.tunnels.open_calls(), 0);
    assert!(h.controller.tunnels(&record.id).unwrap().is_empty());
}

#[tokio::test]
async fn tunnel_to_removed_container_reports_missing_instance() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.runtime.vanish(&record.id);

    let err = h.controller.open_tunnel(&record.id, 3389).await.unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound(_)));
    assert_eq!(h.tunnels.open_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_port_lookup_times_out() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.runtime.stall_host_port();

    let err = h.controller.open_tunnel(&record.id, 3389).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Timeout {
            operation: "host port",
            ..
        }
    ));
    assert_eq!(h.tunnels.open_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn tunnel_opened_for_vanishing_instance_is_closed() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.tunnels.delay_open(Duration::from_secs(5));
    h.tunnels.fail_close();

    let (opened, _) = tokio::join!(h.controller.open_tunnel(&record.id, 3389), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.controller.registry().unregister(&record.id);
    });

    // The close failure is logged; the caller still learns why the open failed.
    assert!(matches!(opened.unwrap_err(), Error::InstanceNotFound(_)));
    assert_eq!(h.tunnels.closed(), vec!["tun-0".to_string()]);
}

#[tokio::test]
async fn stopped_container_is_dropped_and_removed() {
    let h = harness();
    let record = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    h.controller.open_tunnel(&record.id, 3389).await.unwrap();
    h.runtime.stop(&record.id);

    assert!(h.controller.list_active(ALICE).await.unwrap().is_empty());
    assert!(!h.controller.registry().contains(&record.id));
    assert_eq!(h.tunnels.closed(), vec!["tun-0".to_string()]);
    assert!(!h.runtime.has(&record.id));

    // The name is free again.
    let again = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    assert_eq!(again.id, record.id);
}

#[tokio::test]
async fn reconcile_counts_stopped_containers() {
    let h = harness();
    let alice = h.controller.deploy(ALICE, &creds(), None).await.unwrap();
    let bob = h.controller.deploy(BOB, &creds(), None).await.unwrap();
    h.runtime.stop(&alice.id);

    assert_eq!(h.controller.reconcile().await.unwrap(), 1);
    assert!(!h.controller.registry().contains(&alice.id));
    assert!(h.controller.registry().contains(&bob.id));
}
