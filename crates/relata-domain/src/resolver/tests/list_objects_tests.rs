//! ListObjects evaluator tests.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::resolver::{CheckRequest, ContextualTuple, GraphResolver, ListObjectsRequest};

use super::mocks::{create_resolver, MockModelReader, MockTupleReader};

fn sorted(mut objects: Vec<String>) -> Vec<String> {
    objects.sort();
    objects
}

async fn groups_fixture() -> (
    Arc<MockTupleReader>,
    GraphResolver<MockTupleReader, MockModelReader>,
) {
    let (tuples, models, resolver) = create_resolver();
    tuples.add_store("store1").await;
    models
        .add_model(
            "store1",
            r"
            type user

            type group
              relations
                define member: [user, group#member]

            type document
              relations
                define owner: [user]
                define editor: [user, group#member] or owner
                define viewer: [user, user:*] or editor
            ",
        )
        .await;
    (tuples, resolver)
}

#[tokio::test]
async fn test_list_objects_returns_directly_assigned_objects() {
    let (tuples, resolver) = groups_fixture().await;
    tuples
        .add_tuple("store1", "document:1", "viewer", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "document:2", "viewer", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "document:3", "viewer", "user:bob")
        .await;

    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "document", "viewer", "user:anne",
        ))
        .await
        .unwrap();
    assert_eq!(sorted(result.objects), vec!["document:1", "document:2"]);
}

#[tokio::test]
async fn test_list_objects_follows_computed_and_userset_edges() {
    let (tuples, resolver) = groups_fixture().await;
    // via ownership (computed userset chain)
    tuples
        .add_tuple("store1", "document:1", "owner", "user:anne")
        .await;
    // via group membership (userset restriction)
    tuples
        .add_tuple("store1", "document:2", "editor", "group:eng#member")
        .await;
    tuples
        .add_tuple("store1", "group:eng", "member", "user:anne")
        .await;
    // unrelated
    tuples
        .add_tuple("store1", "document:3", "viewer", "user:bob")
        .await;

    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "document", "viewer", "user:anne",
        ))
        .await
        .unwrap();
    assert_eq!(sorted(result.objects), vec!["document:1", "document:2"]);
}

#[tokio::test]
async fn test_list_objects_reaches_through_nested_groups() {
    let (tuples, resolver) = groups_fixture().await;
    tuples
        .add_tuple("store1", "document:1", "editor", "group:eng#member")
        .await;
    tuples
        .add_tuple("store1", "group:eng", "member", "group:backend#member")
        .await;
    tuples
        .add_tuple("store1", "group:backend", "member", "user:anne")
        .await;

    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "document", "viewer", "user:anne",
        ))
        .await
        .unwrap();
    assert_eq!(result.objects, vec!["document:1"]);

    // Listing the groups themselves walks the membership chain too.
    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "group", "member", "user:anne",
        ))
        .await
        .unwrap();
    assert_eq!(sorted(result.objects), vec!["group:backend", "group:eng"]);
}

#[tokio::test]
async fn test_list_objects_wildcard_reaches_all_users_of_type() {
    let (tuples, resolver) = groups_fixture().await;
    tuples
        .add_tuple("store1", "document:1", "viewer", "user:*")
        .await;
    tuples
        .add_tuple("store1", "document:2", "viewer", "user:bob")
        .await;

    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "document", "viewer", "user:anne",
        ))
        .await
        .unwrap();
    assert_eq!(result.objects, vec!["document:1"]);
}

#[tokio::test]
async fn test_list_objects_walks_object_hierarchies() {
    let (tuples, models, resolver) = create_resolver();
    tuples.add_store("store1").await;
    models
        .add_model(
            "store1",
            r"
            type user

            type folder
              relations
                define parent: [folder]
                define viewer: [user] or viewer from parent

            type document
              relations
                define parent: [folder]
                define viewer: viewer from parent
            ",
        )
        .await;

    // folder:root <- folder:sub <- document:leaf
    tuples
        .add_tuple("store1", "folder:root", "viewer", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "folder:sub", "parent", "folder:root")
        .await;
    tuples
        .add_tuple("store1", "document:leaf", "parent", "folder:sub")
        .await;

    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "folder", "viewer", "user:anne",
        ))
        .await
        .unwrap();
    assert_eq!(sorted(result.objects), vec!["folder:root", "folder:sub"]);

    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "document", "viewer", "user:anne",
        ))
        .await
        .unwrap();
    assert_eq!(result.objects, vec!["document:leaf"]);
}

#[tokio::test]
async fn test_list_objects_intersection_uses_check_each() {
    let (tuples, models, resolver) = create_resolver();
    tuples.add_store("store1").await;
    models
        .add_model(
            "store1",
            r"
            type user
            type document
              relations
                define writer: [user]
                define allowed_domain: [user]
                define viewer: writer and allowed_domain
            ",
        )
        .await;

    tuples
        .add_tuple("store1", "document:1", "writer", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "document:1", "writer", "user:bob")
        .await;
    tuples
        .add_tuple("store1", "document:1", "allowed_domain", "user:anne")
        .await;

    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "document", "viewer", "user:anne",
        ))
        .await
        .unwrap();
    assert_eq!(result.objects, vec!["document:1"]);

    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "document", "viewer", "user:bob",
        ))
        .await
        .unwrap();
    assert!(result.objects.is_empty());

    // The reverse index is never consulted on this path.
    assert_eq!(tuples.reverse_index_reads.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_list_objects_exclusion_uses_check_each() {
    let (tuples, models, resolver) = create_resolver();
    tuples.add_store("store1").await;
    models
        .add_model(
            "store1",
            r"
            type user
            type document
              relations
                define editor: [user]
                define blocked: [user]
                define visible: editor but not blocked
            ",
        )
        .await;

    tuples
        .add_tuple("store1", "document:1", "editor", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "document:2", "editor", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "document:2", "blocked", "user:anne")
        .await;

    let result = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "document", "visible", "user:anne",
        ))
        .await
        .unwrap();
    assert_eq!(result.objects, vec!["document:1"]);
}

#[tokio::test]
async fn test_list_objects_honours_result_cap() {
    let (tuples, resolver) = groups_fixture().await;
    for i in 0..2000 {
        tuples
            .add_tuple("store1", &format!("document:{i}"), "viewer", "user:anne")
            .await;
    }

    let mut request = ListObjectsRequest::new("store1", "document", "viewer", "user:anne");
    request.max_results = Some(1000);

    let result = resolver.list_objects(&request).await.unwrap();
    assert_eq!(result.objects.len(), 1000);

    // Each object appears at most once.
    let distinct: std::collections::HashSet<_> = result.objects.iter().collect();
    assert_eq!(distinct.len(), 1000);
}

#[tokio::test]
async fn test_list_objects_deadline_returns_partial_success() {
    let (tuples, resolver) = groups_fixture().await;
    for i in 0..50 {
        tuples
            .add_tuple("store1", &format!("document:{i}"), "viewer", "user:anne")
            .await;
    }
    tuples.set_read_delay(Duration::from_millis(200)).await;

    let mut request = ListObjectsRequest::new("store1", "document", "viewer", "user:anne");
    request.deadline = Some(Duration::from_millis(10));

    // The deadline elapses before the first (delayed) read completes; the
    // call still succeeds with what it has.
    let result = resolver.list_objects(&request).await.unwrap();
    assert!(result.objects.len() < 50);
}

#[tokio::test]
async fn test_list_objects_agrees_with_check() {
    let (tuples, resolver) = groups_fixture().await;
    tuples
        .add_tuple("store1", "document:1", "owner", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "document:2", "editor", "group:eng#member")
        .await;
    tuples
        .add_tuple("store1", "group:eng", "member", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "document:3", "viewer", "user:bob")
        .await;

    let listed = resolver
        .list_objects(&ListObjectsRequest::new(
            "store1", "document", "viewer", "user:anne",
        ))
        .await
        .unwrap()
        .objects;

    for object in ["document:1", "document:2", "document:3"] {
        let checked = resolver
            .check(&CheckRequest::new(
                "store1",
                "user:anne",
                "viewer",
                object,
                vec![],
            ))
            .await
            .unwrap()
            .allowed;
        assert_eq!(
            checked,
            listed.contains(&object.to_string()),
            "check and list disagree on {object}"
        );
    }
}

#[tokio::test]
async fn test_list_objects_merges_contextual_tuples() {
    let (tuples, resolver) = groups_fixture().await;
    tuples
        .add_tuple("store1", "document:1", "viewer", "user:anne")
        .await;

    let request = ListObjectsRequest::new("store1", "document", "viewer", "user:anne")
        .with_contextual_tuples(vec![ContextualTuple::new(
            "user:anne",
            "viewer",
            "document:extra",
        )]);

    let result = resolver.list_objects(&request).await.unwrap();
    assert_eq!(
        sorted(result.objects),
        vec!["document:1", "document:extra"]
    );
}

#[tokio::test]
async fn test_streamed_list_objects_emits_the_same_objects() {
    let (tuples, models, resolver) = create_resolver();
    tuples.add_store("store1").await;
    models
        .add_model(
            "store1",
            r"
            type user
            type document
              relations
                define viewer: [user]
            ",
        )
        .await;
    tuples
        .add_tuple("store1", "document:1", "viewer", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "document:2", "viewer", "user:anne")
        .await;

    let resolver = Arc::new(resolver);
    let stream = resolver
        .streamed_list_objects(ListObjectsRequest::new(
            "store1", "document", "viewer", "user:anne",
        ))
        .await
        .unwrap();

    let objects: Vec<String> = stream
        .map(|item| item.unwrap())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(sorted(objects), vec!["document:1", "document:2"]);
}
