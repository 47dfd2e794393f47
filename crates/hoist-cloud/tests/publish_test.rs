use std::path::Path;
use std::sync::{Arc, Mutex};

use hoist_cloud::publish::{AssetPublisher, PublishError, zip_directory};
use hoist_cloud::remote::{ObjectLocation, ObjectStore, RemoteError};
use hoist_core::{AssetRule, AssetsConfig, Node, Pointer, RewriteStyle, StackTemplate};
use mockall::mock;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

mock! {
    Store {}

    impl ObjectStore for Store {
        fn location(&self, key: &str) -> Result<ObjectLocation, RemoteError>;
        async fn put_object_if_absent(
            &self,
            key: &str,
            body: &[u8],
        ) -> Result<ObjectLocation, RemoteError>;
    }
}

fn at(key: &str) -> ObjectLocation {
    ObjectLocation {
        bucket: "artifacts".to_owned(),
        key: key.to_owned(),
        region: "eu-west-1".to_owned(),
    }
}

fn project() -> TempDir {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("functions/resize")).unwrap();
    std::fs::write(tmp.path().join("functions/resize/index.js"), "exports.h = 1").unwrap();
    std::fs::create_dir_all(tmp.path().join("functions/copy")).unwrap();
    std::fs::write(tmp.path().join("functions/copy/index.js"), "exports.h = 1").unwrap();
    std::fs::write(tmp.path().join("schema.graphql"), "type Query { ok: Boolean }").unwrap();
    tmp
}

fn value_at<'a>(template: &'a StackTemplate, path: &str) -> Option<&'a Node> {
    template.pointer(&Pointer::parse(path).unwrap())
}

const TWO_FUNCTIONS: &str = "\
Resources:
  Resize:
    Type: AWS::Lambda::Function
    Properties:
      Code: functions/resize
  Copy:
    Type: AWS::Lambda::Function
    Properties:
      Code: functions/copy
  Existing:
    Type: AWS::Lambda::Function
    Properties:
      Code: s3://elsewhere/code.zip
";

#[tokio::test]
async fn identical_content_is_uploaded_once() {
    let tmp = project();
    let mut store = MockStore::new();
    let archive = zip_directory(&tmp.path().join("functions/resize")).unwrap();
    let expected = format!("assets/{}.zip", hex::encode(Sha256::digest(&archive)));

    let key_for_upload = expected.clone();
    store
        .expect_put_object_if_absent()
        .withf(move |key, body| key == key_for_upload && body.to_vec() == archive)
        .times(1)
        .returning(|key, _| Ok(at(key)));

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default());
    let template = StackTemplate::parse(TWO_FUNCTIONS).unwrap();
    let published = publisher.publish(&template).await.unwrap();

    let resize = value_at(&published, "/Resources/Resize/Properties/Code").unwrap();
    let copy = value_at(&published, "/Resources/Copy/Properties/Code").unwrap();
    assert_eq!(resize, copy);
    assert_eq!(resize.get("S3Bucket").and_then(Node::as_str), Some("artifacts"));
    assert_eq!(resize.get("S3Key").and_then(Node::as_str), Some(expected.as_str()));
    assert_eq!(
        value_at(&published, "/Resources/Existing/Properties/Code").and_then(Node::as_str),
        Some("s3://elsewhere/code.zip")
    );
}

#[tokio::test]
async fn input_template_is_left_untouched() {
    let tmp = project();
    let mut store = MockStore::new();
    store
        .expect_put_object_if_absent()
        .returning(|key, _| Ok(at(key)));

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default());
    let template = StackTemplate::parse(TWO_FUNCTIONS).unwrap();
    let before = template.clone();
    publisher.publish(&template).await.unwrap();

    assert_eq!(template, before);
}

#[tokio::test]
async fn missing_local_path_fails_before_uploading() {
    let tmp = project();
    let mut store = MockStore::new();
    store.expect_put_object_if_absent().never();

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default());
    let template = StackTemplate::parse(
        "Resources:\n  Gone:\n    Type: AWS::Lambda::Function\n    Properties:\n      Code: functions/missing\n",
    )
    .unwrap();
    let err = publisher.publish(&template).await.unwrap_err();

    assert!(matches!(
        err,
        PublishError::AssetNotFound { ref logical_id, .. } if logical_id == "Gone"
    ));
}

#[tokio::test]
async fn upload_failure_is_wrapped() {
    let tmp = project();
    let mut store = MockStore::new();
    store
        .expect_put_object_if_absent()
        .returning(|_, _| Err(RemoteError::NoBucket));

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default());
    let template = StackTemplate::parse(TWO_FUNCTIONS).unwrap();
    let err = publisher.publish(&template).await.unwrap_err();

    assert!(matches!(err, PublishError::Upload { .. }));
}

#[tokio::test]
async fn file_assets_use_uri_rewrites() {
    let tmp = project();
    let mut store = MockStore::new();
    store
        .expect_put_object_if_absent()
        .withf(|key, body| {
            !key.ends_with(".zip") && body.to_vec() == b"type Query { ok: Boolean }".to_vec()
        })
        .times(1)
        .returning(|key, _| Ok(at(key)));

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default());
    let template = StackTemplate::parse(
        "Resources:\n  Schema:\n    Type: AWS::AppSync::GraphQLSchema\n    Properties:\n      DefinitionS3Location: schema.graphql\n",
    )
    .unwrap();
    let published = publisher.publish(&template).await.unwrap();

    let uri = value_at(&published, "/Resources/Schema/Properties/DefinitionS3Location")
        .and_then(Node::as_str)
        .unwrap();
    assert!(uri.starts_with("s3://artifacts/assets/"));
}

#[tokio::test]
async fn custom_allow_list_replaces_builtin_table() {
    let tmp = project();
    let mut store = MockStore::new();
    store
        .expect_put_object_if_absent()
        .times(1)
        .returning(|key, _| Ok(at(key)));

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default())
        .with_rules(vec![AssetRule {
            resource_type: "Custom::Site".to_owned(),
            property: "Source/Path".to_owned(),
            rewrite: RewriteStyle::HttpsUrl,
        }]);
    let template = StackTemplate::parse(
        "Resources:\n  Site:\n    Type: Custom::Site\n    Properties:\n      Source:\n        Path: functions/resize\n  Fn:\n    Type: AWS::Lambda::Function\n    Properties:\n      Code: functions/copy\n",
    )
    .unwrap();
    let references = publisher.find_references(&template).unwrap();
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].logical_id, "Site");

    let published = publisher.publish(&template).await.unwrap();
    let url = value_at(&published, "/Resources/Site/Properties/Source/Path")
        .and_then(Node::as_str)
        .unwrap();
    assert!(url.starts_with("https://artifacts.s3.eu-west-1.amazonaws.com/assets/"));
    assert_eq!(
        value_at(&published, "/Resources/Fn/Properties/Code").and_then(Node::as_str),
        Some("functions/copy")
    );
}

#[tokio::test]
async fn plan_rewrites_without_uploading() {
    let tmp = project();
    let mut store = MockStore::new();
    store.expect_put_object_if_absent().never();
    store.expect_location().returning(|key| Ok(at(key)));

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default());
    let template = StackTemplate::parse(TWO_FUNCTIONS).unwrap();
    let planned = publisher.plan(&template).await.unwrap();

    let code = value_at(&planned, "/Resources/Resize/Properties/Code").unwrap();
    assert!(code.get("S3Key").and_then(Node::as_str).unwrap().starts_with("assets/"));
}

async fn planned_key(root: &Path) -> Option<String> {
    let mut store = MockStore::new();
    store.expect_location().returning(|key| Ok(at(key)));

    let publisher = AssetPublisher::new(&store, root, &AssetsConfig::default());
    let template = StackTemplate::parse(TWO_FUNCTIONS).unwrap();
    let planned = publisher.plan(&template).await.unwrap();
    value_at(&planned, "/Resources/Resize/Properties/Code/S3Key")
        .and_then(Node::as_str)
        .map(str::to_owned)
}

#[tokio::test]
async fn keys_depend_only_on_content() {
    let first = project();
    let second = project();

    let key = planned_key(first.path()).await;
    assert!(key.is_some());
    assert_eq!(key, planned_key(second.path()).await);
}

// ── Nested stacks ──

const NESTING: &str = "\
Resources:
  AddonsStack:
    Type: AWS::CloudFormation::Stack
    Properties:
      TemplateURL: .hoist/build/addons.yml
";

const NESTED_FUNCTION: &str = "\
Resources:
  Fn:
    Type: AWS::Lambda::Function
    Properties:
      Code: functions/resize
";

type Uploads = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

fn recording_store(uploads: &Uploads) -> MockStore {
    let mut store = MockStore::new();
    let recorded = Arc::clone(uploads);
    store
        .expect_put_object_if_absent()
        .returning(move |key, body| {
            recorded.lock().unwrap().push((key.to_owned(), body.to_vec()));
            Ok(at(key))
        });
    store
}

#[tokio::test]
async fn nested_template_assets_are_published_before_the_template() {
    let tmp = project();
    std::fs::create_dir_all(tmp.path().join(".hoist/build")).unwrap();
    std::fs::write(tmp.path().join(".hoist/build/addons.yml"), NESTED_FUNCTION).unwrap();
    let uploads = Uploads::default();
    let store = recording_store(&uploads);

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default());
    let published = publisher
        .publish(&StackTemplate::parse(NESTING).unwrap())
        .await
        .unwrap();

    let uploads = uploads.lock().unwrap();
    assert_eq!(uploads.len(), 2);
    let (template_key, body) = uploads
        .iter()
        .find(|(key, _)| key.ends_with(".yml"))
        .unwrap();
    assert_eq!(
        *template_key,
        format!("assets/{}.yml", hex::encode(Sha256::digest(body)))
    );

    let nested = StackTemplate::parse(std::str::from_utf8(body).unwrap()).unwrap();
    let code = value_at(&nested, "/Resources/Fn/Properties/Code").unwrap();
    let code_key = code.get("S3Key").and_then(Node::as_str).unwrap();
    assert!(uploads.iter().any(|(key, _)| key == code_key));

    assert_eq!(
        value_at(&published, "/Resources/AddonsStack/Properties/TemplateURL")
            .and_then(Node::as_str),
        Some(format!("https://artifacts.s3.eu-west-1.amazonaws.com/{template_key}").as_str())
    );
}

#[tokio::test]
async fn in_memory_nested_template_needs_no_file() {
    let tmp = project();
    let mut store = MockStore::new();
    store.expect_put_object_if_absent().never();
    store.expect_location().returning(|key| Ok(at(key)));

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default())
        .with_nested_template(
            ".hoist/build/addons.yml",
            StackTemplate::parse(NESTED_FUNCTION).unwrap(),
        );
    let planned = publisher
        .plan(&StackTemplate::parse(NESTING).unwrap())
        .await
        .unwrap();

    assert!(!tmp.path().join(".hoist/build/addons.yml").exists());
    let url = value_at(&planned, "/Resources/AddonsStack/Properties/TemplateURL")
        .and_then(Node::as_str)
        .unwrap();
    assert!(url.ends_with(".yml"));
}

#[tokio::test]
async fn missing_nested_template_is_reported() {
    let tmp = project();
    let mut store = MockStore::new();
    store.expect_put_object_if_absent().never();

    let publisher = AssetPublisher::new(&store, tmp.path(), &AssetsConfig::default());
    let err = publisher
        .publish(&StackTemplate::parse(NESTING).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PublishError::AssetNotFound { ref logical_id, .. } if logical_id == "AddonsStack"
    ));
}
