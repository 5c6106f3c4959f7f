use anyhow::anyhow;
use futures_util::FutureExt;
use resource_expander::{
    mask, ErrorPolicy, Expansion, ExpanderRegistry, ExpansionTree, FieldLink, MethodDef,
    EXPANSION_ERRORS_KEY,
};
use serde_json::{json, Value};

/// Registry mimicking a course catalog: instructors come from a reusable
/// user lookup, parents are courses themselves (and recurse).
fn course_registry() -> ExpanderRegistry {
    let mut registry = ExpanderRegistry::new();

    registry.add_reusable(
        "Users",
        "byId",
        MethodDef::new(|ctx| {
            async move {
                let id = ctx.args.first().cloned().unwrap_or(Value::Null);
                match id.as_i64() {
                    Some(1) => Ok(json!({"id": 1, "name": "Ada", "bio": "wrote the first program"})),
                    Some(2) => Ok(json!({"id": 2, "name": "Grace", "bio": "invented the compiler"})),
                    _ => Err(anyhow!("unknown user {id}")),
                }
            }
            .boxed()
        }),
    );
    registry.add_link(
        "CourseDto",
        "instructor",
        FieldLink::new("Users", "byId").params(["instructorId"]),
    );

    registry.add_method(
        "CourseDto",
        "parent",
        MethodDef::new(|ctx| {
            async move {
                match ctx.parent.get("parentId").and_then(Value::as_i64) {
                    Some(10) => Ok(json!({
                        "id": 10,
                        "title": "Computing 101",
                        "description": "intro",
                        "instructorId": 2
                    })),
                    _ => Ok(Value::Null),
                }
            }
            .boxed()
        })
        .target("CourseDto"),
    );

    registry.validate(&["CourseDto"]).unwrap();
    registry
}

fn courses() -> Value {
    json!([
        {
            "id": 20,
            "title": "Advanced Computing",
            "description": "deep dive",
            "instructorId": 1,
            "parentId": 10
        },
        {
            "id": 21,
            "title": "Computing Lab",
            "description": "hands on",
            "instructorId": 2,
            "parentId": null
        }
    ])
}

#[tokio::test]
async fn expands_and_selects_course_collection() {
    let registry = course_registry();
    let expansion = Expansion::new(&registry);

    let expands = ExpansionTree::parse("instructor,parent.instructor");
    let selects = ExpansionTree::parse("*,-description,instructor.*,-instructor.bio");

    let expanded = expansion
        .expand(courses(), &expands, "CourseDto", None, &Value::Null)
        .await
        .unwrap();
    let result = mask(expanded, &selects);

    let first = &result[0];
    // instructor populated, bio stripped by selection
    assert_eq!(first["instructor"]["name"], json!("Ada"));
    assert!(first["instructor"].get("bio").is_none());
    // description excluded at the root
    assert!(first.get("description").is_none());
    // parent.instructor populated through recursion
    assert_eq!(first["parent"]["instructor"]["name"], json!("Grace"));
    // nothing else stripped
    assert_eq!(first["id"], json!(20));
    assert_eq!(first["title"], json!("Advanced Computing"));
    assert_eq!(first["parent"]["title"], json!("Computing 101"));

    // course without a parent keeps the null expansion result
    let second = &result[1];
    assert_eq!(second["instructor"]["name"], json!("Grace"));
    assert_eq!(second["parent"], Value::Null);
}

#[tokio::test]
async fn expands_single_object_under_root_field() {
    let registry = course_registry();
    let expansion = Expansion::new(&registry);

    let wrapped = json!({"data": {"id": 20, "title": "Advanced Computing", "instructorId": 1}});
    let expands = ExpansionTree::parse("instructor");

    let result = expansion
        .expand(wrapped, &expands, "CourseDto", Some("data"), &Value::Null)
        .await
        .unwrap();
    assert_eq!(result["data"]["instructor"]["name"], json!("Ada"));
}

#[tokio::test]
async fn ignore_policy_drops_failed_paths() {
    let registry = course_registry();
    let expansion = Expansion::with_policy(&registry, ErrorPolicy::Ignore);

    // instructorId 99 makes the user lookup fail
    let course = json!({"id": 30, "instructorId": 99});
    let result = expansion
        .expand(
            course,
            &ExpansionTree::parse("instructor"),
            "CourseDto",
            None,
            &Value::Null,
        )
        .await
        .unwrap();

    assert!(result.get("instructor").is_none());
    assert!(result.get(EXPANSION_ERRORS_KEY).is_none());
}

#[tokio::test]
async fn include_policy_attaches_errors_per_item() {
    let registry = course_registry();
    let expansion = Expansion::with_policy(&registry, ErrorPolicy::Include);

    let courses = json!([
        {"id": 30, "instructorId": 99},
        {"id": 31, "instructorId": 1}
    ]);
    let result = expansion
        .expand(
            courses,
            &ExpansionTree::parse("instructor"),
            "CourseDto",
            None,
            &Value::Null,
        )
        .await
        .unwrap();

    let errors = &result[0][EXPANSION_ERRORS_KEY];
    let entry = &errors["CourseDto[0].instructor"];
    assert!(entry["message"].as_str().unwrap().contains("unknown user"));
    assert_eq!(entry["path"], json!("CourseDto[0].instructor"));

    // the healthy item has no error map
    assert!(result[1].get(EXPANSION_ERRORS_KEY).is_none());
    assert_eq!(result[1]["instructor"]["name"], json!("Ada"));
}

#[tokio::test]
async fn throw_policy_propagates() {
    let registry = course_registry();
    let expansion = Expansion::with_policy(&registry, ErrorPolicy::Throw);

    let course = json!({"id": 30, "instructorId": 99});
    let result = expansion
        .expand(
            course,
            &ExpansionTree::parse("instructor"),
            "CourseDto",
            None,
            &Value::Null,
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn empty_tree_returns_resource_untouched() {
    let registry = course_registry();
    let expansion = Expansion::new(&registry);

    let original = json!({"id": 1, "anything": true});
    let result = expansion
        .expand(
            original.clone(),
            &ExpansionTree::new(),
            "CourseDto",
            None,
            &Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(result, original);
}
