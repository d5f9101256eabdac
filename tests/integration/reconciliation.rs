//! Discovery and reconciliation of nginx entities against a scripted process table

use std::sync::Arc;

use lookout::entity::{Entity, EntityType, PlusInfo};
use lookout::managers::{Manager, ReconcileReport};
use lookout::registry::Query;
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn nginx_entities(registry: &lookout::registry::SharedRegistry) -> Vec<Arc<Entity>> {
    registry
        .read()
        .unwrap()
        .find_by_types(&[EntityType::Nginx])
}

#[tokio::test]
async fn test_new_master_is_registered_under_root() {
    let registry = lookout::registry::Registry::shared();
    let _host = with_root(&registry).await;
    let processes = ScriptedProcesses::default();
    processes.set(nginx_rows(100, &[101, 102]));

    let mut manager = nginx_manager(&registry, &processes);
    let report = manager.discover().await.unwrap();
    assert_eq!(report.new, 1);

    let nginx = nginx_entities(&registry).remove(0);
    let root = registry.read().unwrap().root().unwrap();
    let parent = registry
        .read()
        .unwrap()
        .find_parent(nginx.id().unwrap())
        .unwrap();
    assert!(Arc::ptr_eq(&parent, &root));

    let details = nginx.nginx_details().unwrap();
    assert_eq!(details.pid, 100);
    assert_eq!(details.workers(), vec![101, 102]);
    assert_eq!(nginx.root_uuid(), Some("uuid-1"));
    assert_eq!(
        event_messages(&nginx),
        vec!["nginx-1.25.3 master process found, pid 100".to_string()]
    );
}

#[tokio::test]
async fn test_unchanged_world_is_a_noop() {
    let registry = lookout::registry::Registry::shared();
    let _host = with_root(&registry).await;
    let processes = ScriptedProcesses::default();
    processes.set(nginx_rows(100, &[101]));

    let mut manager = nginx_manager(&registry, &processes);
    manager.discover().await.unwrap();
    let before = nginx_entities(&registry);

    let report = manager.discover().await.unwrap();
    assert_eq!(report, ReconcileReport::default());

    let after = nginx_entities(&registry);
    assert!(Arc::ptr_eq(&before[0], &after[0]));
}

#[tokio::test]
async fn test_worker_change_updates_in_place() {
    let registry = lookout::registry::Registry::shared();
    let _host = with_root(&registry).await;
    let processes = ScriptedProcesses::default();
    processes.set(nginx_rows(100, &[101]));

    let mut manager = nginx_manager(&registry, &processes);
    manager.discover().await.unwrap();
    let before = nginx_entities(&registry).remove(0);

    processes.set(nginx_rows(100, &[201, 202]));
    let report = manager.discover().await.unwrap();
    assert_eq!(report.reloaded, 1);
    assert_eq!(report.replaced, 0);

    let after = nginx_entities(&registry).remove(0);
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.nginx_details().unwrap().workers(), vec![201, 202]);
}

#[tokio::test]
async fn test_pid_change_replaces_with_same_id() {
    let registry = lookout::registry::Registry::shared();
    let _host = with_root(&registry).await;
    let processes = ScriptedProcesses::default();
    processes.set(nginx_rows(100, &[101]));

    let mut manager = nginx_manager(&registry, &processes);
    manager.discover().await.unwrap();
    let old = nginx_entities(&registry).remove(0);
    event_messages(&old);

    processes.set(nginx_rows(300, &[301]));
    let report = manager.discover().await.unwrap();
    assert_eq!(report.replaced, 1);

    let new = nginx_entities(&registry).remove(0);
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.id(), old.id());
    assert_eq!(new.definition_hash(), old.definition_hash());
    assert_eq!(
        event_messages(&new),
        vec!["nginx-1.25.3 master process restarted/reloaded, new pid 300, old pid 100".to_string()]
    );
}

#[tokio::test]
async fn test_need_restart_tears_children_down_first() {
    let registry = lookout::registry::Registry::shared();
    let _host = with_root(&registry).await;
    let processes = ScriptedProcesses::default();
    processes.set(nginx_rows(100, &[101]));

    let mut manager = nginx_manager(&registry, &processes);
    manager.run_once().await;
    let old = nginx_entities(&registry).remove(0);
    let old_id = old.id().unwrap();

    let mut child_ids = Vec::new();
    for name in ["backend", "api"] {
        let child = Arc::new(Entity::plus(
            EntityType::Upstream,
            PlusInfo {
                parent_local_id: old.local_id().unwrap().clone(),
                local_name: name.to_string(),
            },
            Some("uuid-1".to_string()),
        ));
        child_ids.push(registry.write().unwrap().register(child, Some(old_id)).unwrap());
    }
    manager.core().start_entities(manager.types());
    assert!(old.is_running());

    event_messages(&old);
    old.set_need_restart();
    let report = manager.discover().await.unwrap();
    assert_eq!(report.replaced, 1);
    assert!(!old.is_running());

    let registry = registry.read().unwrap();
    for id in child_ids {
        assert!(registry.find_one(id).is_none());
    }
    let new = registry.find_one(old_id).unwrap();
    assert!(!new.need_restart());
    assert!(registry.find_all(&Query::all().parent(old_id)).is_empty());
    assert!(registry.is_consistent());
    drop(registry);

    let messages = event_messages(&new);
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0],
        "nginx-1.25.3 config changed, read from /etc/nginx/nginx.conf"
    );
}

#[tokio::test]
async fn test_vanished_master_is_removed_with_children() {
    let registry = lookout::registry::Registry::shared();
    let _host = with_root(&registry).await;
    let processes = ScriptedProcesses::default();
    processes.set(nginx_rows(100, &[101]));

    let mut manager = nginx_manager(&registry, &processes);
    manager.discover().await.unwrap();
    let nginx = nginx_entities(&registry).remove(0);
    let child = Arc::new(Entity::new(EntityType::Cache, None));
    registry
        .write()
        .unwrap()
        .register(child.clone(), nginx.id())
        .unwrap();

    processes.set(Vec::new());
    let report = manager.discover().await.unwrap();
    assert_eq!(report.removed, 1);

    let registry = registry.read().unwrap();
    assert_eq!(registry.len(), 1);
    assert!(child.id().is_some_and(|id| registry.find_one(id).is_none()));
    assert!(registry.is_consistent());
}

#[tokio::test]
async fn test_failed_scan_keeps_registry() {
    let registry = lookout::registry::Registry::shared();
    let _host = with_root(&registry).await;
    let processes = ScriptedProcesses::default();
    processes.set(nginx_rows(100, &[101]));

    let mut manager = nginx_manager(&registry, &processes);
    manager.run_once().await;

    processes.fail();
    assert!(manager.discover().await.is_err());
    assert!(manager.run_once().await.is_empty());

    let nginx = nginx_entities(&registry);
    assert_eq!(nginx.len(), 1);
    assert!(nginx[0].is_running());
}

#[tokio::test]
async fn test_host_stop_marks_everything_stopped() {
    let registry = lookout::registry::Registry::shared();
    let mut host = with_root(&registry).await;
    let processes = ScriptedProcesses::default();
    processes.set(nginx_rows(100, &[101]));

    let mut manager = nginx_manager(&registry, &processes);
    host.run_once().await;
    manager.run_once().await;

    manager.stop().await;
    host.stop().await;

    let registry = registry.read().unwrap();
    assert_eq!(registry.len(), 2);
    assert!(registry.find_all(&Query::all()).iter().all(|e| !e.is_running()));
}
