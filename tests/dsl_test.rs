use arbor::dsl::Tree;
use arbor::dsl::builder::{concurrence, cursor, define, participant, sequence};
use arbor::dsl::is_truthy;
use arbor::runtime::workitem::{Command, Workitem};
use serde_json::{Map, json};

#[test]
fn test_builder_shapes_the_tree() {
    let tree = define([
        participant("alpha").forget(),
        concurrence([participant("bravo"), participant("charly").lose()]).attr("count", 1),
        cursor([sequence([participant("delta")])]),
    ]);

    assert_eq!(tree.name, "define");
    assert_eq!(tree.children.len(), 3);
    assert!(tree.children[0].is_forget());
    assert!(!tree.children[0].is_lose());
    assert_eq!(tree.children[1].attr_usize("count"), Some(1));
    assert!(tree.children[1].children[1].is_lose());
    assert_eq!(tree.children[2].children[0].children[0].name, "delta");
}

#[test]
fn test_attribute_coercions() {
    let tree = Tree::new("concurrence")
        .attr("count", "2")
        .attr("merge", "last")
        .attr("forget", "yes");
    assert_eq!(tree.attr_usize("count"), Some(2));
    assert_eq!(tree.attr_str("merge"), Some("last"));
    assert!(tree.is_forget());

    assert_eq!(Tree::new("x").attr("count", "two").attr_usize("count"), None);
    assert!(is_truthy(&json!(true)));
    assert!(is_truthy(&json!("TRUE")));
    assert!(is_truthy(&json!(1)));
    assert!(!is_truthy(&json!(0)));
    assert!(!is_truthy(&json!("no")));
    assert!(!is_truthy(&json!(null)));
}

#[test]
fn test_workitem_commands() {
    let mut workitem = Workitem::new(Map::new());
    assert_eq!(workitem.command(), None);

    workitem.set_command(Command::Rewind);
    assert_eq!(workitem.command(), Some(Command::Rewind));
    assert_eq!(workitem.take_command(), Some(Command::Rewind));
    assert_eq!(workitem.command(), None);
}

#[test]
fn test_workitem_merge() {
    let mut a = Workitem::default();
    a.set_field("k", "a");
    let mut b = Workitem::default();
    b.set_field("k", "b");
    b.set_field("only_b", 1);

    let mut kept = a.clone();
    kept.merge_from(&b, true);
    assert_eq!(kept.field("k"), Some(&json!("a")));
    assert_eq!(kept.field("only_b"), Some(&json!(1)));

    let mut overwritten = a.clone();
    overwritten.merge_from(&b, false);
    assert_eq!(overwritten.field("k"), Some(&json!("b")));
}
