//! Resource handle tests: cache levels, writes, actions, metadata, leases

use chrono::Utc;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use twinhub_core::model::ActionFuture;
use twinhub_core::{
    Command, Gateway, GatewayConfig, GatewayError, GetLevel, ResourceHandle, ResourcePath,
    ResourceType, TimedValue, Value, ValueType,
};

fn gateway() -> Gateway {
    Gateway::new(GatewayConfig::default()).unwrap()
}

/// Register a model whose "reading" resource pulls from a counting getter
fn register_metered_model(gw: &Gateway, calls: Arc<AtomicUsize>, cache: Duration) {
    gw.execute(Command::new(move |_twin, registry| {
        registry
            .create_model("meter")
            .service("sensor")
            .resource("reading")
            .value_type(ValueType::Integer)
            .cache_period(cache)
            .external_getter(move |_path: &ResourcePath| -> anyhow::Result<TimedValue> {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(TimedValue::new(Value::from(n as i64), Utc::now()))
            })
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("meter", "m1")
    }))
    .wait()
    .unwrap();
}

fn get_reading(gw: &Gateway, level: GetLevel) -> TimedValue {
    gw.execute(Command::new(move |_twin, registry| {
        let rc = registry
            .resolve_resource("m1", "sensor", "reading", None)?
            .expect("resource resolves");
        rc.get(level)
    }))
    .wait()
    .unwrap()
}

#[test]
fn test_weak_get_never_calls_the_getter() {
    let gw = gateway();
    let calls = Arc::new(AtomicUsize::new(0));
    register_metered_model(&gw, calls.clone(), Duration::from_secs(60));

    assert_eq!(get_reading(&gw, GetLevel::Weak), TimedValue::never());
    assert_eq!(get_reading(&gw, GetLevel::Weak), TimedValue::never());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_strong_get_always_calls_the_getter() {
    let gw = gateway();
    let calls = Arc::new(AtomicUsize::new(0));
    register_metered_model(&gw, calls.clone(), Duration::from_secs(60));

    for expected in 1..=3i64 {
        let tv = get_reading(&gw, GetLevel::Strong);
        assert_eq!(tv.value, Some(Value::from(expected)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_normal_get_honors_freshness() {
    let gw = gateway();
    let calls = Arc::new(AtomicUsize::new(0));
    register_metered_model(&gw, calls.clone(), Duration::from_secs(60));

    // first read pulls, second is served from cache
    assert_eq!(
        get_reading(&gw, GetLevel::Normal).value,
        Some(Value::from(1))
    );
    assert_eq!(
        get_reading(&gw, GetLevel::Normal).value,
        Some(Value::from(1))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_normal_get_pulls_once_stale() {
    let gw = gateway();
    let calls = Arc::new(AtomicUsize::new(0));
    register_metered_model(&gw, calls.clone(), Duration::from_millis(0));

    assert_eq!(
        get_reading(&gw, GetLevel::Normal).value,
        Some(Value::from(1))
    );
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(
        get_reading(&gw, GetLevel::Normal).value,
        Some(Value::from(2))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_fetch_records_last_external_fetch() {
    let gw = gateway();
    let calls = Arc::new(AtomicUsize::new(0));
    register_metered_model(&gw, calls.clone(), Duration::from_secs(60));

    let (before, after) = gw
        .execute(Command::new(|_twin, registry| {
            let rc = registry
                .resolve_resource("m1", "sensor", "reading", None)?
                .expect("resource resolves");
            let before = rc.last_external_fetch()?;
            rc.get(GetLevel::Strong)?;
            Ok((before, rc.last_external_fetch()?))
        }))
        .wait()
        .unwrap();
    assert!(before.is_none());
    assert!(after.is_some());
}

#[test]
fn test_levels_collapse_without_getter() {
    let gw = gateway();
    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("plain")
            .service("svc")
            .resource("value")
            .value_type(ValueType::Integer)
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("plain", "p1")
    }))
    .wait()
    .unwrap();

    let t0 = Utc::now();
    let reads = gw
        .execute(Command::new(move |_twin, registry| {
            let rc = registry
                .resolve_resource("p1", "svc", "value", None)?
                .expect("resource resolves");
            rc.set_with_timestamp(Value::from(9), t0)?;
            Ok((
                rc.get(GetLevel::Weak)?,
                rc.get(GetLevel::Normal)?,
                rc.get(GetLevel::Strong)?,
            ))
        }))
        .wait()
        .unwrap();
    let expected = TimedValue::new(Value::from(9), t0);
    assert_eq!(reads.0, expected);
    assert_eq!(reads.1, expected);
    assert_eq!(reads.2, expected);
}

#[test]
fn test_getter_failure_leaves_cache_untouched() {
    let gw = gateway();
    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("flaky")
            .service("svc")
            .resource("value")
            .value_type(ValueType::Integer)
            .external_getter(|_path: &ResourcePath| -> anyhow::Result<TimedValue> {
                anyhow::bail!("device offline")
            })
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("flaky", "f1")
    }))
    .wait()
    .unwrap();

    let t0 = Utc::now();
    gw.execute(Command::new(move |_twin, registry| {
        let rc = registry
            .resolve_resource("f1", "svc", "value", None)?
            .expect("resource resolves");
        rc.set_with_timestamp(Value::from(7), t0)
    }))
    .wait()
    .unwrap();

    let err = gw
        .execute(Command::<TimedValue>::new(|_twin, registry| {
            let rc = registry
                .resolve_resource("f1", "svc", "value", None)?
                .expect("resource resolves");
            rc.get(GetLevel::Strong)
        }))
        .wait()
        .unwrap_err();
    assert!(matches!(err, GatewayError::External(_)));

    // the cached value survived the failed pull
    let cached = gw
        .execute(Command::new(|_twin, registry| {
            let rc = registry
                .resolve_resource("f1", "svc", "value", None)?
                .expect("resource resolves");
            rc.get(GetLevel::Weak)
        }))
        .wait()
        .unwrap();
    assert_eq!(cached, TimedValue::new(Value::from(7), t0));
}

#[test]
fn test_set_rejects_type_mismatch() {
    let gw = gateway();
    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("typed")
            .service("svc")
            .resource("count")
            .value_type(ValueType::Integer)
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("typed", "t1")
    }))
    .wait()
    .unwrap();

    let err = gw
        .execute(Command::new(|_twin, registry| {
            let rc = registry
                .resolve_resource("t1", "svc", "count", None)?
                .expect("resource resolves");
            rc.set(Value::from("not a number"))
        }))
        .wait()
        .unwrap_err();
    assert!(matches!(err, GatewayError::TypeMismatch { .. }));
}

#[test]
fn test_set_accepts_equal_timestamp() {
    let gw = gateway();
    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("plain")
            .service("svc")
            .resource("value")
            .value_type(ValueType::Integer)
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("plain", "p1")
    }))
    .wait()
    .unwrap();

    let t0 = Utc::now();
    let tv = gw
        .execute(Command::new(move |_twin, registry| {
            let rc = registry
                .resolve_resource("p1", "svc", "value", None)?
                .expect("resource resolves");
            rc.set_with_timestamp(Value::from(1), t0)?;
            rc.set_with_timestamp(Value::from(2), t0)?;
            rc.get(GetLevel::Weak)
        }))
        .wait()
        .unwrap();
    assert_eq!(tv, TimedValue::new(Value::from(2), t0));
}

fn register_action_model(gw: &Gateway) {
    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("switch")
            .service("control")
            .resource("toggle")
            .action_arguments(vec![("factor".to_string(), ValueType::Integer)])
            .action_handler(|_path: &ResourcePath, args: Vec<Value>| -> ActionFuture {
                Box::pin(async move {
                    let factor = args[0].as_i64().unwrap_or(0);
                    Ok(Value::from(factor * 2))
                })
            })
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("switch", "s1")
    }))
    .wait()
    .unwrap();
}

#[test]
fn test_act_resolves_after_the_command() {
    let gw = gateway();
    register_action_model(&gw);

    let pending = gw
        .execute(Command::new(|_twin, registry| {
            let rc = registry
                .resolve_resource("s1", "control", "toggle", None)?
                .expect("resource resolves");
            assert_eq!(rc.resource_type(), ResourceType::Action);
            rc.act(vec![Value::from(21)])
        }))
        .wait()
        .unwrap();

    // the command slot is long finished; the action resolves on its own
    let result = pending.wait().unwrap();
    assert_eq!(result, Value::from(42));
}

#[test]
fn test_act_validates_arguments() {
    let gw = gateway();
    register_action_model(&gw);

    let (arity_err, type_err) = gw
        .execute(Command::new(|_twin, registry| {
            let rc = registry
                .resolve_resource("s1", "control", "toggle", None)?
                .expect("resource resolves");
            let arity = rc.act(vec![]).unwrap_err();
            let types = rc.act(vec![Value::from("three")]).unwrap_err();
            Ok((arity, types))
        }))
        .wait()
        .unwrap();
    assert!(matches!(arity_err, GatewayError::InvalidArguments(_)));
    assert!(matches!(type_err, GatewayError::InvalidArguments(_)));
}

#[test]
fn test_act_only_works_on_actions() {
    let gw = gateway();
    register_action_model(&gw);

    let (act_err, get_err, set_err) = gw
        .execute(Command::new(|_twin, registry| {
            let friendly = registry
                .resolve_resource("s1", "admin", "friendlyName", None)?
                .expect("resource resolves");
            let toggle = registry
                .resolve_resource("s1", "control", "toggle", None)?
                .expect("resource resolves");
            Ok((
                friendly.act(vec![]).unwrap_err(),
                toggle.get(GetLevel::Normal).unwrap_err(),
                toggle.set(Value::from(1)).unwrap_err(),
            ))
        }))
        .wait()
        .unwrap();
    assert!(matches!(act_err, GatewayError::NotAnAction(_)));
    assert!(matches!(get_err, GatewayError::NotReadable(_)));
    assert!(matches!(set_err, GatewayError::NotReadable(_)));
}

#[test]
fn test_action_without_handler_is_refused() {
    let gw = gateway();
    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("inert")
            .service("control")
            .resource("fire")
            .resource_type(ResourceType::Action)
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("inert", "i1")
    }))
    .wait()
    .unwrap();

    let err = gw
        .execute(Command::new(|_twin, registry| {
            let rc = registry
                .resolve_resource("i1", "control", "fire", None)?
                .expect("resource resolves");
            rc.act(vec![]).map(|_| ())
        }))
        .wait()
        .unwrap_err();
    assert!(matches!(err, GatewayError::NoActionHandler(_)));
}

#[test]
fn test_metadata_defaults_and_overrides() {
    let gw = gateway();
    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("meta")
            .service("svc")
            .resource("value")
            .value_type(ValueType::Integer)
            .default_metadata("unit", Value::from("celsius"))
            .default_metadata("precision", Value::from(2))
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("meta", "m1")
    }))
    .wait()
    .unwrap();

    gw.execute(Command::new(|_twin, registry| {
        let rc = registry
            .resolve_resource("m1", "svc", "value", None)?
            .expect("resource resolves");
        assert_eq!(rc.metadata_value("unit")?, Some(Value::from("celsius")));
        rc.set_metadata_value("unit", Value::from("fahrenheit"))
    }))
    .wait()
    .unwrap();

    // overrides persist across commands, defaults stay underneath
    let metadata = gw
        .execute(Command::new(|_twin, registry| {
            let rc = registry
                .resolve_resource("m1", "svc", "value", None)?
                .expect("resource resolves");
            rc.metadata_values()
        }))
        .wait()
        .unwrap();
    assert_eq!(metadata.get("unit"), Some(&Value::from("fahrenheit")));
    assert_eq!(metadata.get("precision"), Some(&Value::from(2)));
}

thread_local! {
    static SMUGGLED: RefCell<Option<ResourceHandle>> = const { RefCell::new(None) };
}

#[test]
fn test_handle_expires_with_its_command() {
    let gw = gateway();
    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("plain")
            .service("svc")
            .resource("value")
            .value_type(ValueType::Integer)
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("plain", "p1")
    }))
    .wait()
    .unwrap();

    gw.execute(Command::new(|_twin, registry| {
        let rc = registry
            .resolve_resource("p1", "svc", "value", None)?
            .expect("resource resolves");
        assert!(rc.is_valid());
        // stash the handle on the gateway thread past its command
        SMUGGLED.with(|s| *s.borrow_mut() = Some(rc));
        Ok(())
    }))
    .wait()
    .unwrap();

    gw.execute(Command::new(|_twin, _registry| {
        let rc = SMUGGLED
            .with(|s| s.borrow_mut().take())
            .expect("handle was stashed");
        assert!(!rc.is_valid());
        assert!(matches!(
            rc.get(GetLevel::Weak),
            Err(GatewayError::ConcurrencyMisuse)
        ));
        assert!(matches!(
            rc.set(Value::from(1)),
            Err(GatewayError::ConcurrencyMisuse)
        ));
        assert!(matches!(
            rc.metadata_values(),
            Err(GatewayError::ConcurrencyMisuse)
        ));
        Ok(())
    }))
    .wait()
    .unwrap();
}
