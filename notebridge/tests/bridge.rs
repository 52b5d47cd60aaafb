//! End-to-end tests of the bridge over the instrumented mock runtime.
//!
//! Covers the core guarantees: proxy identity, wrap/unwrap round-trips,
//! exactly-once worker registration, thread confinement of native calls,
//! staleness eviction, and the release protocol.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

use notebridge::settings::{POOL_SIZE, RECHECK_MILLIS};
use notebridge::{Error, NativeRuntime, NativeValue, Session, Settings, Value};
use notebridge_mock::MockRuntime;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

fn open_session(mock: &Arc<MockRuntime>, pool: usize) -> Session {
    Lazy::force(&TRACING);
    let mut settings = Settings::new();
    settings.set(POOL_SIZE, pool as u64);
    settings.set(RECHECK_MILLIS, 25u64);
    Session::open(Arc::clone(mock) as Arc<dyn NativeRuntime>, &settings).unwrap()
}

// ═══════════════════════════════════════════════════════════════════
// Identity and round-trips
// ═══════════════════════════════════════════════════════════════════

mod identity {
    use super::*;

    #[test]
    fn reopening_a_container_returns_the_same_proxy() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_container("Srv01!!Mail/Team.box");
        let session = open_session(&mock, 1);

        // Different spellings of the same logical address.
        let first = session.open_container(r"Srv01!!Mail\Team.box").unwrap();
        let second = session.open_container("srv01!!mail/team.box").unwrap();
        assert!(first.is_same(&second));

        session.close();
    }

    #[test]
    fn repeated_key_lookup_returns_the_same_record_proxy() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_record("srv!!crm.box", "acct-1", vec![]);
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!crm.box").unwrap();

        let a = container.record_by_key("acct-1").unwrap().unwrap();
        let b = container.record_by_key("acct-1").unwrap().unwrap();
        assert!(a.is_same(&b));
        assert_eq!(a.handle(), b.handle());

        session.close();
    }

    #[test]
    fn concurrent_reopens_converge_on_one_proxy() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_container("srv!!race.box");
        let session = open_session(&mock, 4);

        // Wraps happen on caller threads, so the lookup-or-create step in
        // the identity cache is raced directly. The gate lines the callers
        // up before every open.
        let gate = Arc::new(std::sync::Barrier::new(4));
        let mut callers = Vec::new();
        for _ in 0..4 {
            let session = session.clone();
            let gate = Arc::clone(&gate);
            callers.push(thread::spawn(move || {
                let mut opened = Vec::new();
                for _ in 0..50 {
                    gate.wait();
                    opened.push(session.open_container("srv!!race.box").unwrap());
                }
                opened
            }));
        }
        let opened: Vec<_> = callers
            .into_iter()
            .flat_map(|caller| caller.join().unwrap())
            .collect();

        let first = &opened[0];
        for container in &opened {
            assert!(container.is_same(first));
        }

        session.close();
    }

    #[test]
    fn proxy_argument_round_trips_to_the_same_proxy() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_container("srv!!crm.box");
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!crm.box").unwrap();
        let source = container.create_record().unwrap();
        let linked = container.create_record().unwrap();

        // The proxy crosses to the native side as its handle and comes back
        // through the identity cache.
        source.write_property("Link", linked.clone()).unwrap();
        let read = source.read_property("Link").unwrap();
        let read = read.as_proxy().and_then(|p| p.as_record()).unwrap();
        assert!(read.is_same(&linked));

        session.close();
    }

    #[test]
    fn heterogeneous_list_results_wrap_per_element() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_container("srv!!crm.box");
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!crm.box").unwrap();
        let record = container.create_record().unwrap();
        let other = container.create_record().unwrap();

        record
            .write_property(
                "Mixed",
                Value::List(vec![Value::from(7), Value::from("seven"), other.clone().into()]),
            )
            .unwrap();

        let list = record.read_property("Mixed").unwrap();
        let items = list.as_list().unwrap();
        assert_eq!(items[0].as_int(), Some(7));
        assert_eq!(items[1].as_text(), Some("seven"));
        let wrapped = items[2].as_proxy().and_then(|p| p.as_record()).unwrap();
        assert!(wrapped.is_same(&other));

        session.close();
    }

    #[test]
    fn unmanaged_native_types_surface_as_opaque() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_record(
            "srv!!crm.box",
            "acct-1",
            vec![("Body", NativeValue::Opaque("richtext".to_string()))],
        );
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!crm.box").unwrap();
        let record = container.record_by_key("acct-1").unwrap().unwrap();

        match record.read_property("Body").unwrap() {
            Value::Opaque(tag) => assert_eq!(tag, "richtext"),
            other => panic!("expected opaque marker, got {other:?}"),
        }

        // Same marker through the item path ("Body" sorts first).
        let item = record.first_item().unwrap().unwrap();
        assert!(matches!(item.value().unwrap(), Value::Opaque(_)));

        session.close();
    }

    #[test]
    fn staleness_replaces_the_cached_proxy() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_container("srv!!crm.box");
        let session = open_session(&mock, 1);

        let first = session.open_container("srv!!crm.box").unwrap();
        // The resource behind the address changes logical identity.
        mock.diverge_identity("srv!!crm.box");
        let second = session.open_container("srv!!crm.box").unwrap();

        assert!(!first.is_same(&second));
        // And the replacement is now the cached one.
        let third = session.open_container("srv!!crm.box").unwrap();
        assert!(second.is_same(&third));

        session.close();
    }
}

// ═══════════════════════════════════════════════════════════════════
// Worker pool and thread confinement
// ═══════════════════════════════════════════════════════════════════

mod confinement {
    use super::*;

    #[test]
    fn registration_fires_once_per_worker_regardless_of_load() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_record("srv!!crm.box", "acct-1", vec![]);
        let session = open_session(&mock, 3);
        let container = session.open_container("srv!!crm.box").unwrap();
        let record = container.record_by_key("acct-1").unwrap().unwrap();

        let mut callers = Vec::new();
        for _ in 0..8 {
            let record = record.clone();
            callers.push(thread::spawn(move || {
                for _ in 0..10 {
                    record.read_property("Key").unwrap();
                }
            }));
        }
        for caller in callers {
            caller.join().unwrap();
        }

        assert_eq!(mock.registration_count(), 3);
        session.close();
        assert_eq!(mock.deregistration_count(), 3);
    }

    #[test]
    fn native_calls_never_run_on_caller_threads() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_record("srv!!a.box", "one", vec![("N", NativeValue::Int(1))]);
        mock.seed_record("srv!!a.box", "two", vec![("N", NativeValue::Int(2))]);
        let session = open_session(&mock, 2);
        let container = session.open_container("srv!!a.box").unwrap();
        let one = container.record_by_key("one").unwrap().unwrap();
        let two = container.record_by_key("two").unwrap().unwrap();

        let mut caller_ids = HashSet::new();
        caller_ids.insert(thread::current().id());
        let mut callers = Vec::new();
        for record in [one, two] {
            callers.push(thread::spawn(move || {
                let id = thread::current().id();
                for _ in 0..20 {
                    record.read_property("N").unwrap();
                }
                id
            }));
        }
        for caller in callers {
            caller_ids.insert(caller.join().unwrap());
        }

        // Every native call executed on a worker, none on a caller. The
        // mock additionally rejects calls from unregistered threads, so a
        // confinement violation would have failed the reads outright.
        for executed_on in mock.call_threads() {
            assert!(!caller_ids.contains(&executed_on));
        }

        session.close();
    }

    #[test]
    fn three_callers_share_a_single_worker_without_deadlock() {
        let mock = Arc::new(MockRuntime::new());
        for (key, n) in [("a", 1i64), ("b", 2), ("c", 3)] {
            mock.seed_record("srv!!a.box", key, vec![("N", NativeValue::Int(n))]);
        }
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!a.box").unwrap();

        let mut callers = Vec::new();
        for (key, expected) in [("a", 1i64), ("b", 2), ("c", 3)] {
            let record = container.record_by_key(key).unwrap().unwrap();
            callers.push(thread::spawn(move || {
                let got = record.read_property("N").unwrap();
                assert_eq!(got.as_int(), Some(expected));
            }));
        }
        for caller in callers {
            caller.join().unwrap();
        }

        session.close();
    }

    #[test]
    fn registration_failure_fails_open_and_nothing_reaches_the_runtime() {
        let mock = Arc::new(MockRuntime::new());
        mock.set_fail_registration(true);

        let mut settings = Settings::new();
        settings.set(POOL_SIZE, 2u64);
        let err = Session::open(Arc::clone(&mock) as Arc<dyn NativeRuntime>, &settings)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(mock.calls().is_empty());
    }
}

// ═══════════════════════════════════════════════════════════════════
// Release protocol
// ═══════════════════════════════════════════════════════════════════

mod release {
    use super::*;

    #[test]
    fn double_release_is_quiet_then_use_is_stale() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_record("srv!!a.box", "one", vec![]);
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!a.box").unwrap();
        let record = container.record_by_key("one").unwrap().unwrap();

        record.release();
        record.release(); // no-op, must not fault

        let err = record.read_property("Key").unwrap_err();
        assert!(matches!(err, Error::StaleHandle { .. }));
        assert!(mock.is_released(record.handle()));

        // A released proxy cannot sneak through as an argument either.
        let fresh = container.create_record().unwrap();
        let err = fresh.write_property("Link", record.clone()).unwrap_err();
        assert!(matches!(err, Error::StaleHandle { .. }));

        session.close();
    }

    #[test]
    fn bulk_release_reclaims_handles_without_live_proxies() {
        let mock = Arc::new(MockRuntime::new());
        for key in ["a", "b", "c"] {
            mock.seed_record("srv!!a.box", key, vec![]);
        }
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!a.box").unwrap();
        let kept = container.record_by_key("a").unwrap().unwrap();

        let barrier = session.barrier();
        {
            let view = container.open_view("All").unwrap().unwrap();
            let records: Vec<_> = view.entries().collect::<Result<_, _>>().unwrap();
            assert_eq!(records.len(), 3);
            assert!(records[0].is_same(&kept));
            // view and record proxies drop here
        }

        // Swept: the view handle, the two loose record handles, and the
        // spare handle the walk produced for the already-proxied record.
        let released = session.bulk_release(barrier);
        assert_eq!(released, 4);

        // The surviving proxy and its handle were not touched.
        kept.read_property("Key").unwrap();
        assert!(!mock.is_released(kept.handle()));

        session.close();
    }

    #[test]
    fn close_releases_everything_and_is_idempotent() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_record("srv!!a.box", "one", vec![]);
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!a.box").unwrap();
        let record = container.record_by_key("one").unwrap().unwrap();

        session.close();
        session.close();

        assert!(mock.is_released(record.handle()));
        assert!(mock.is_released(container.handle()));
        assert!(mock.is_released(session.handle()));
        assert!(matches!(
            record.read_property("Key").unwrap_err(),
            Error::StaleHandle { .. }
        ));
        // Every registered worker deregistered on close.
        assert_eq!(mock.registration_count(), mock.deregistration_count());
    }
}

// ═══════════════════════════════════════════════════════════════════
// Proxy surface
// ═══════════════════════════════════════════════════════════════════

mod surface {
    use super::*;

    #[test]
    fn parent_backreferences_reuse_context() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_record("srv!!a.box", "one", vec![]);
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!a.box").unwrap();
        let record = container.record_by_key("one").unwrap().unwrap();

        assert!(record.container().unwrap().is_same(&container));
        assert!(container.session().unwrap().is_same(&session));
        assert_eq!(container.address(), Some("srv!!a.box"));

        session.close();
    }

    #[test]
    fn linked_record_reports_its_own_container() {
        let mock = Arc::new(MockRuntime::new());
        let session = open_session(&mock, 1);
        let home = session.open_container("srv!!one.box").unwrap();
        let away = session.open_container("srv!!two.box").unwrap();

        let note = home.create_record().unwrap();
        {
            // The linked record's proxy does not survive this block, so the
            // read below re-wraps it with the reading record as its parent.
            let target = away.create_record().unwrap();
            note.write_property("Link", target).unwrap();
        }

        let link = note.read_property("Link").unwrap();
        let link = link.as_proxy().and_then(|p| p.as_record()).unwrap().clone();

        // A record parent says nothing about where the link lives; the
        // answer must come from the runtime, not from `note`'s ancestry.
        assert!(link.container().unwrap().is_same(&away));

        session.close();
    }

    #[test]
    fn absent_lookups_are_none_not_errors() -> anyhow::Result<()> {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_container("srv!!a.box");
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!a.box")?;

        assert!(container.record_by_key("missing")?.is_none());
        assert!(container.open_view("NoSuchView")?.is_none());

        let empty = container.create_record()?;
        assert!(empty.read_property("Nothing")?.is_null());

        session.close();
        Ok(())
    }

    #[test]
    fn view_walks_records_in_creation_order() {
        let mock = Arc::new(MockRuntime::new());
        for (key, n) in [("a", 1i64), ("b", 2), ("c", 3)] {
            mock.seed_record("srv!!a.box", key, vec![("N", NativeValue::Int(n))]);
        }
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!a.box").unwrap();
        let view = container.open_view("All").unwrap().unwrap();

        let ns: Vec<i64> = view
            .entries()
            .map(|record| record.unwrap().read_property("N").unwrap().as_int().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3]);

        session.close();
    }

    #[test]
    fn save_and_remove_round_trip() {
        let mock = Arc::new(MockRuntime::new());
        mock.seed_container("srv!!a.box");
        let session = open_session(&mock, 1);
        let container = session.open_container("srv!!a.box").unwrap();

        let record = container.create_record().unwrap();
        record.write_property("Key", "fresh").unwrap();
        record.save().unwrap();
        assert!(container.record_by_key("fresh").unwrap().is_some());

        record.remove().unwrap();
        assert!(container.record_by_key("fresh").unwrap().is_none());

        session.close();
    }
}
