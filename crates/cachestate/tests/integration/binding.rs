use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use cachestate::binding::{CacheFactory, KeyStrategy, SignalOptions};
use cachestate::caching::{CacheKey, CallSite};
use cachestate::config::Config;

use crate::skip_throttle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u32,
    name: String,
    revision: u32,
}

/// A tiny service whose lookups are cached and whose writes signal the cache.
struct Users {
    revision: Arc<AtomicU32>,
}

impl Users {
    fn fetch(&self) -> impl Fn(u32, ()) -> std::future::Ready<anyhow::Result<User>> + use<> {
        let revision = self.revision.clone();
        move |id, ()| {
            std::future::ready(Ok(User {
                id,
                name: format!("user {id}"),
                revision: revision.load(Ordering::SeqCst),
            }))
        }
    }
}

fn user_key(id: &u32, site: &CallSite) -> Option<CacheKey> {
    CacheKey::from_args(&CallSite::new(site.identity.clone(), "get"), &[id]).ok()
}

#[tokio::test(start_paused = true)]
async fn test_updater_refreshes_cached_lookup() {
    cachestate_test::setup();
    let config: Config = Default::default();
    let factory = CacheFactory::from_config(&config);
    let users = Users {
        revision: Default::default(),
    };

    let mut options = factory.options();
    options.config.updated_notifier_key = Some("users".into());
    let get_user = factory
        .cached_with(CallSite::new("Users", "get"), users.fetch(), options)
        .with_key_strategy(KeyStrategy::Generator(Arc::new(|id: &u32, site: &CallSite| {
            CacheKey::from_args(site, &[id]).unwrap()
        })));

    let rename = factory
        .updater(
            CallSite::new("Users", "rename"),
            SignalOptions::default()
                .with_notifier_key("users")
                .with_key_generator(user_key),
        )
        .unwrap()
        .wrap({
            let revision = users.revision.clone();
            move |_id: u32| revision.fetch_add(1, Ordering::SeqCst) + 1
        });

    assert_eq!(get_user.key_for(&7).unwrap().as_str(), "Users#get_[7]");

    let mut stream = get_user.call(7, ()).unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.revision, 0);
    assert_eq!(first.name, "user 7");

    skip_throttle().await;
    assert_eq!(rename(7), 1);

    let updated = stream.next().await.unwrap().unwrap();
    assert_eq!(updated.revision, 1);
    assert_eq!(get_user.get(7, ()).await.unwrap(), updated);
}

#[tokio::test(start_paused = true)]
async fn test_default_keys_separate_operations() {
    let factory = CacheFactory::default();

    let double = factory.cached(CallSite::new("Math", "double"), |n: u32, _: ()| async move {
        anyhow::Ok(n * 2)
    });
    let square = factory.cached(CallSite::new("Math", "square"), |n: u32, _: ()| async move {
        anyhow::Ok(n * n)
    });

    assert_eq!(double.get(3, ()).await, Ok(6));
    assert_eq!(square.get(3, ()).await, Ok(9));
    assert_ne!(double.key_for(&3).unwrap(), square.key_for(&3).unwrap());

    double.shutdown().await;
    square.shutdown().await;
    assert_eq!(factory.bus().update_all_channel().subscriber_count(), 0);
}

#[tokio::test]
async fn test_missing_notifier_fails_at_setup() {
    let factory = CacheFactory::default();

    let err = factory
        .invalidator::<u32>(CallSite::new("Users", "delete"), SignalOptions::default())
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalidator requires either a notifier or a notifier key"
    );
}
