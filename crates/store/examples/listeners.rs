//! Registers payload shapes, decodes a manifest, and watches a pool react.
//!
//! Run with `cargo run -p roster-store --example listeners`.

use roster_core::Action;
use roster_schema::TypeRegistry;
use roster_store::Pool;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Greeting {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Seen {
    #[serde(default)]
    times: u32,
}

const DOC: &str = "apiVersion: example.com/v1alpha1
kind: Greeting
metadata:
  name: hello
spec:
  message: hello, world
";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = TypeRegistry::new();
    registry.register::<Greeting, Seen>("example.com/v1alpha1", "Greeting");

    let pool: Pool = Pool::new()?;
    pool.listen(|_, action, m| {
        let message = m.spec.downcast_ref::<Greeting>().map(|g| g.message.as_str()).unwrap_or("<none>");
        println!("{} {} ({})", action, m.key(), message);
    });
    pool.listen_with_id(|me| {
        move |pool: &Pool, action: Action, mut m: roster_core::Manifest| {
            if action != Action::Created {
                return;
            }
            m.status = roster_core::DynPayload::new(Seen { times: 1 });
            pool.apply_except(me, m);
        }
    });

    let manifest = registry.auto_parse(DOC)?;
    pool.apply(manifest.clone());
    pool.settled().await;
    pool.settled().await;

    if let Some(stored) = pool.get_by_key(&manifest.key()) {
        println!("status: {:?}", stored.status);
    }
    pool.delete(&manifest.key());
    pool.settled().await;
    Ok(())
}
