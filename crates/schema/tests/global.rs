use roster_core::ManifestError;
use roster_schema::{auto_parse_str, RegistryError, TypeRegistry};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct MySpec {
    #[serde(default)]
    message: String,
}

const DOC: &str = "apiVersion: example.com/v1alpha1
kind: MyManifest
metadata:
  name: m1
spec:
  message: hello
";

// One test per binary: the global registry can only be installed once per process.
#[test]
fn global_registry_lifecycle() {
    assert!(TypeRegistry::global().is_none());
    let before = auto_parse_str(DOC).unwrap();
    assert_eq!(before.errors.len(), 2);
    assert!(before.errors.iter().all(|e| matches!(e, ManifestError::UnresolvedType { .. })));

    let reg = TypeRegistry::new();
    reg.register::<MySpec, MySpec>("example.com/v1alpha1", "MyManifest");
    let global = reg.install_global().unwrap();
    assert_eq!(global.len(), 1);
    assert!(matches!(TypeRegistry::new().install_global(), Err(RegistryError::AlreadyInstalled)));

    let after = auto_parse_str(DOC).unwrap();
    assert!(after.errors.is_empty());
    assert_eq!(after.spec.downcast_ref::<MySpec>().map(|s| s.message.as_str()), Some("hello"));

    // registering after install is still visible
    global.register::<MySpec, MySpec>("example.com/v1alpha1", "Other");
    let other = auto_parse_str(&DOC.replace("MyManifest", "Other")).unwrap();
    assert!(other.errors.is_empty());
}
