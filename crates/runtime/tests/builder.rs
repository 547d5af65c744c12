#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::ConfigMap;
use kolibri_core::{EventKind, NamespaceScope, SourceError};
use kolibri_kubehub::MemorySource;
use kolibri_runtime::{BuildError, HandlerBuilder};

fn builder() -> HandlerBuilder<ConfigMap> { HandlerBuilder::new() }

#[test]
fn callbacks_are_required() {
    let res = builder().build(MemorySource::<ConfigMap>::new());
    assert_eq!(res.err(), Some(BuildError::NoCallbacks));
}

#[test]
fn callback_registered_twice_is_rejected() {
    let res = builder()
        .on_change(|_ctx| async { Ok(()) })
        .on_change(|_ctx| async { Ok(()) })
        .build(MemorySource::<ConfigMap>::new());
    assert_eq!(res.err(), Some(BuildError::DuplicateCallback(EventKind::Update)));
}

#[test]
fn namespace_set_twice_is_rejected() {
    let res = builder()
        .on_namespace("a")
        .on_all_namespaces()
        .on_create(|_ctx| async { Ok(()) })
        .build(MemorySource::<ConfigMap>::new());
    assert_eq!(res.err(), Some(BuildError::DuplicateNamespace));
}

#[test]
fn first_misuse_is_reported() {
    let res = builder()
        .on_delete(|_ctx| async { Ok(()) })
        .on_delete(|_ctx| async { Ok(()) })
        .on_current_namespace()
        .on_current_namespace()
        .build(MemorySource::<ConfigMap>::new());
    assert_eq!(res.err(), Some(BuildError::DuplicateCallback(EventKind::Delete)));
}

#[test]
fn zero_workers_is_rejected() {
    let res = builder().workers(0).on_create(|_ctx| async { Ok(()) }).build(MemorySource::<ConfigMap>::new());
    assert_eq!(res.err(), Some(BuildError::InvalidWorkers));
}

#[test]
fn source_creation_failure_surfaces() {
    let res = builder()
        .on_create(|_ctx| async { Ok(()) })
        .build(|_: &NamespaceScope| -> Result<MemorySource<ConfigMap>, SourceError> { Err(SourceError::Unavailable("no cluster".into())) });
    assert_eq!(res.err(), Some(BuildError::Source(SourceError::Unavailable("no cluster".into()))));
}

#[test]
fn scope_reaches_the_source() {
    let src = MemorySource::<ConfigMap>::new();
    let h = builder().on_namespace("prod").on_create(|_ctx| async { Ok(()) }).build(src.clone()).unwrap();
    assert_eq!(h.source().namespace().as_deref(), Some("prod"));

    let src = MemorySource::<ConfigMap>::new();
    builder().on_current_namespace().on_create(|_ctx| async { Ok(()) }).build(src.clone()).unwrap();
    assert_eq!(src.namespace().as_deref(), Some("default"));

    let src = MemorySource::<ConfigMap>::new();
    builder().on_create(|_ctx| async { Ok(()) }).build(src.clone()).unwrap();
    assert_eq!(src.namespace(), None);
}

#[test]
fn names_default_to_resource_type() {
    let h = builder().controller("ctl").on_create(|_ctx| async { Ok(()) }).build(MemorySource::<ConfigMap>::new()).unwrap();
    assert_eq!(h.name(), "v1/ConfigMap");
    assert!(h.queue().name().starts_with("kolibri:ctl:v1/ConfigMap@"), "{}", h.queue().name());

    let h = builder().name("cm-sync").on_create(|_ctx| async { Ok(()) }).build(MemorySource::<ConfigMap>::new()).unwrap();
    assert_eq!(h.name(), "cm-sync");
    assert_ne!(h.queue().name(), builder().on_create(|_ctx| async { Ok(()) }).build(MemorySource::<ConfigMap>::new()).unwrap().queue().name());
}
