//! Expand evaluator tests.

use crate::error::DomainError;
use crate::resolver::{ExpandLeafValue, ExpandNode, ExpandRequest};

use super::mocks::create_resolver;

fn leaf_users(node: &ExpandNode) -> Vec<String> {
    match node {
        ExpandNode::Leaf(leaf) => match &leaf.value {
            ExpandLeafValue::Users(users) => users.clone(),
            ExpandLeafValue::Computed { .. } => vec![],
        },
        _ => vec![],
    }
}

#[tokio::test]
async fn test_expand_direct_relation_lists_assigned_users() {
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
                define viewer: [user, group#member, user:*]
            ",
        )
        .await;
    tuples
        .add_tuple("store1", "document:1", "viewer", "user:anne")
        .await;
    tuples
        .add_tuple("store1", "document:1", "viewer", "group:eng#member")
        .await;
    tuples
        .add_tuple("store1", "document:1", "viewer", "user:*")
        .await;

    let result = resolver
        .expand(&ExpandRequest::new("store1", "viewer", "document:1"))
        .await
        .unwrap();

    let mut users = leaf_users(&result.tree.root);
    users.sort();
    assert_eq!(users, vec!["group:eng#member", "user:*", "user:anne"]);
    assert_eq!(result.tree.root.name(), "document:1#viewer");
}

#[tokio::test]
async fn test_expand_union_mirrors_rewrite_structure() {
    let (tuples, models, resolver) = create_resolver();
    tuples.add_store("store1").await;
    models
        .add_model(
            "store1",
            r"
            type user
            type document
              relations
                define owner: [user]
                define viewer: [user] or owner
            ",
        )
        .await;
    tuples
        .add_tuple("store1", "document:1", "viewer", "user:anne")
        .await;

    let result = resolver
        .expand(&ExpandRequest::new("store1", "viewer", "document:1"))
        .await
        .unwrap();

    let ExpandNode::Union { nodes, .. } = &result.tree.root else {
        panic!("expected union root, got {:?}", result.tree.root);
    };
    assert_eq!(nodes.len(), 2);
    assert_eq!(leaf_users(&nodes[0]), vec!["user:anne"]);

    let ExpandNode::Leaf(computed) = &nodes[1] else {
        panic!("expected computed leaf");
    };
    assert!(matches!(
        &computed.value,
        ExpandLeafValue::Computed { userset } if userset == "document:1#owner"
    ));
}

#[tokio::test]
async fn test_expand_tuple_to_userset_names_parent_usersets() {
    let (tuples, models, resolver) = create_resolver();
    tuples.add_store("store1").await;
    models
        .add_model(
            "store1",
            r"
            type user
            type folder
              relations
                define viewer: [user]
            type document
              relations
                define parent: [folder]
                define viewer: viewer from parent
            ",
        )
        .await;
    tuples
        .add_tuple("store1", "document:1", "parent", "folder:budgets")
        .await;
    tuples
        .add_tuple("store1", "document:1", "parent", "folder:archive")
        .await;
    // A userset tupleset user is skipped silently.
    tuples
        .add_tuple("store1", "document:1", "parent", "folder:x#viewer")
        .await;

    let result = resolver
        .expand(&ExpandRequest::new("store1", "viewer", "document:1"))
        .await
        .unwrap();

    let ExpandNode::Union { nodes, .. } = &result.tree.root else {
        panic!("expected union for tuple-to-userset expansion");
    };
    let mut usersets: Vec<String> = nodes
        .iter()
        .filter_map(|n| match n {
            ExpandNode::Leaf(leaf) => match &leaf.value {
                ExpandLeafValue::Computed { userset } => Some(userset.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect();
    usersets.sort();
    assert_eq!(
        usersets,
        vec!["folder:archive#viewer", "folder:budgets#viewer"]
    );
}

#[tokio::test]
async fn test_expand_difference_keeps_both_sides() {
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

    let result = resolver
        .expand(&ExpandRequest::new("store1", "visible", "document:1"))
        .await
        .unwrap();

    let ExpandNode::Difference { base, subtract, .. } = &result.tree.root else {
        panic!("expected difference root");
    };
    assert!(matches!(
        &**base,
        ExpandNode::Leaf(leaf) if matches!(
            &leaf.value,
            ExpandLeafValue::Computed { userset } if userset == "document:1#editor"
        )
    ));
    assert!(matches!(
        &**subtract,
        ExpandNode::Leaf(leaf) if matches!(
            &leaf.value,
            ExpandLeafValue::Computed { userset } if userset == "document:1#blocked"
        )
    ));
}

#[tokio::test]
async fn test_expand_does_not_recurse_into_referenced_usersets() {
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
                define viewer: [user, group#member]
            ",
        )
        .await;
    tuples
        .add_tuple("store1", "document:1", "viewer", "group:eng#member")
        .await;
    tuples
        .add_tuple("store1", "group:eng", "member", "user:anne")
        .await;

    let result = resolver
        .expand(&ExpandRequest::new("store1", "viewer", "document:1"))
        .await
        .unwrap();

    // The first level names the userset; anne only appears by following it.
    assert_eq!(leaf_users(&result.tree.root), vec!["group:eng#member"]);
}

#[tokio::test]
async fn test_expand_unknown_relation_errors() {
    let (tuples, models, resolver) = create_resolver();
    tuples.add_store("store1").await;
    models
        .add_model("store1", "type user\ntype document\n  relations\n    define viewer: [user]")
        .await;

    let err = resolver
        .expand(&ExpandRequest::new("store1", "approver", "document:1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::RelationNotFound { .. }));
}
