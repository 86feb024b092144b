//! Tests for model building and the schema registry

use twinhub_core::{
    Command, Gateway, GatewayConfig, GatewayError, ResourceType, ValueType, ADMIN_SERVICE,
    DEFAULT_NAMESPACE,
};

fn gateway() -> Gateway {
    Gateway::new(GatewayConfig::default()).unwrap()
}

#[test]
fn test_empty_model_has_admin_service() {
    let gw = gateway();

    let model = gw
        .execute(Command::new(|_twin, registry| {
            registry.create_model("testmodel").build()
        }))
        .wait()
        .unwrap();

    assert_eq!(model.name, "testmodel");
    assert_eq!(model.namespace, DEFAULT_NAMESPACE);
    assert_eq!(model.services.len(), 1);
    let admin = model.service(ADMIN_SERVICE).unwrap();
    assert!(!admin.resources.is_empty());
    assert!(admin.resource("friendlyName").is_some());
}

#[test]
fn test_basic_resource_defaults_to_sensor() {
    let gw = gateway();

    let model = gw
        .execute(Command::new(|_twin, registry| {
            registry
                .create_model("testmodel")
                .service("testservice")
                .resource("testValue")
                .value_type(ValueType::Integer)
                .build()
                .build()
                .build()
        }))
        .wait()
        .unwrap();

    let resource = model.resource("testservice", "testValue").unwrap();
    assert_eq!(resource.resource_type, ResourceType::Sensor);
    assert_eq!(resource.value_type, ValueType::Integer);
    assert!(resource.arguments.is_empty());
}

#[test]
fn test_duplicate_model_rejected() {
    let gw = gateway();

    gw.execute(Command::new(|_twin, registry| {
        registry.create_model("dup").build().map(|_| ())
    }))
    .wait()
    .unwrap();

    let err = gw
        .execute(Command::new(|_twin, registry| {
            registry.create_model("dup").build().map(|_| ())
        }))
        .wait()
        .unwrap_err();
    assert!(matches!(err, GatewayError::DuplicateModel { .. }));
}

#[test]
fn test_models_live_in_namespaces() {
    let gw = gateway();

    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("meter")
            .namespace("energy")
            .build()
            .map(|_| ())
    }))
    .wait()
    .unwrap();

    let (in_energy, in_default) = gw
        .execute(Command::new(|_twin, registry| {
            Ok((
                registry.get_model("energy", "meter")?.is_some(),
                registry.get_model(DEFAULT_NAMESPACE, "meter")?.is_some(),
            ))
        }))
        .wait()
        .unwrap();
    assert!(in_energy);
    assert!(!in_default);
}

#[test]
fn test_provider_shape_matches_model() {
    let gw = gateway();

    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("thermometer")
            .service("sensor")
            .resource("temperature")
            .value_type(ValueType::Float)
            .build()
            .resource("humidity")
            .value_type(ValueType::Float)
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("thermometer", "roof")
    }))
    .wait()
    .unwrap();

    let snapshot = gw
        .execute(Command::new(|twin, _registry| {
            Ok(twin.snapshot_provider("roof")?.expect("provider exists"))
        }))
        .wait()
        .unwrap();

    assert_eq!(snapshot.model, "thermometer");
    let mut service_names: Vec<_> = snapshot.services.iter().map(|s| s.name.clone()).collect();
    service_names.sort();
    assert_eq!(service_names, vec!["admin", "sensor"]);
    let sensor = snapshot.service("sensor").unwrap();
    assert_eq!(sensor.resources.len(), 2);

    // the admin service starts with friendlyName = provider name
    let friendly = snapshot.resource(ADMIN_SERVICE, "friendlyName").unwrap();
    assert_eq!(
        friendly.value.value,
        Some(twinhub_core::Value::from("roof"))
    );
}

#[test]
fn test_duplicate_provider_rejected() {
    let gw = gateway();

    let err = gw
        .execute(Command::new(|_twin, registry| {
            registry.create_model("m").build()?;
            registry.create_provider_instance("m", "p1")?;
            registry.create_provider_instance("m", "p1")
        }))
        .wait()
        .unwrap_err();
    assert!(matches!(err, GatewayError::DuplicateProvider(_)));
}

#[test]
fn test_provider_from_unknown_model_rejected() {
    let gw = gateway();

    let err = gw
        .execute(Command::new(|_twin, registry| {
            registry.create_provider_instance("nope", "p1")
        }))
        .wait()
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnknownModel(_)));
}

#[test]
fn test_resolve_resource_checks_model() {
    let gw = gateway();

    gw.execute(Command::new(|_twin, registry| {
        registry
            .create_model("thermometer")
            .service("sensor")
            .resource("temperature")
            .value_type(ValueType::Float)
            .build()
            .build()
            .build()?;
        registry.create_provider_instance("thermometer", "roof")
    }))
    .wait()
    .unwrap();

    let (plain, matching, mismatching, missing) = gw
        .execute(Command::new(|_twin, registry| {
            Ok((
                registry
                    .resolve_resource("roof", "sensor", "temperature", None)?
                    .is_some(),
                registry
                    .resolve_resource("roof", "sensor", "temperature", Some("thermometer"))?
                    .is_some(),
                registry
                    .resolve_resource("roof", "sensor", "temperature", Some("hygrometer"))?
                    .is_some(),
                registry
                    .resolve_resource("roof", "sensor", "pressure", None)?
                    .is_some(),
            ))
        }))
        .wait()
        .unwrap();

    assert!(plain);
    assert!(matching);
    assert!(!mismatching);
    assert!(!missing);
}

#[test]
fn test_ensure_provider_creates_only_once() {
    let gw = gateway();

    let (first, second) = gw
        .execute(Command::new(|_twin, registry| {
            registry.create_model("m").build()?;
            Ok((
                registry.ensure_provider_instance("m", "p1")?,
                registry.ensure_provider_instance("m", "p1")?,
            ))
        }))
        .wait()
        .unwrap();
    assert!(first);
    assert!(!second);

    // an existing provider of another model is a conflict
    let err = gw
        .execute(Command::new(|_twin, registry| {
            registry.create_model("other").build()?;
            registry.ensure_provider_instance("other", "p1").map(|_| ())
        }))
        .wait()
        .unwrap_err();
    assert!(matches!(err, GatewayError::DuplicateProvider(_)));
}

#[test]
fn test_delete_model_is_idempotent() {
    let gw = gateway();

    gw.execute(Command::new(|_twin, registry| {
        registry.delete_model(DEFAULT_NAMESPACE, "never-registered")
    }))
    .wait()
    .unwrap();
}
