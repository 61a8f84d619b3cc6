//! Device identity, the stored affiliation, and the attribution window.
//!
//! [`AttributionEngine`] owns the identity store and a small in-process mirror of the values
//! that `initialize()` sets. The store is authoritative: whenever a mirror value is unset, the
//! engine falls back to the persisted one.
use std::{
    sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;

use crate::{
    hooks::{Clock, IdentifierChangeCallback},
    id_generator::IdGenerator,
    identity_store::{keys, IdentityStore},
    Result,
};

#[derive(Default)]
struct EngineState {
    initialized: bool,
    company_code: Option<String>,
    verbose_logging: bool,
    attribution_window: Option<Duration>,
    offer_code: Option<String>,
    change_callback: Option<Arc<dyn IdentifierChangeCallback>>,
}

pub(crate) struct AttributionEngine {
    store: Arc<dyn IdentityStore>,
    id_generator: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    state: RwLock<EngineState>,
}

impl AttributionEngine {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        id_generator: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> AttributionEngine {
        AttributionEngine {
            store,
            id_generator,
            clock,
            state: RwLock::new(EngineState::default()),
        }
    }

    // A panicking callback could poison the lock. The state stays consistent in that case (every
    // write is a single assignment), so recover instead of propagating the panic.
    fn state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Set up company code, verbose logging, and the attribution window. Returns `false` without
    /// changing anything if the engine has already been initialized.
    pub async fn initialize(
        &self,
        company_code: Option<&str>,
        verbose_logging: bool,
        attribution_window: Option<Duration>,
    ) -> Result<bool> {
        {
            let mut state = self.state_mut();
            if state.initialized {
                return Ok(false);
            }
            state.initialized = true;
            state.verbose_logging = verbose_logging;
            state.company_code = company_code.filter(|code| !code.is_empty()).map(str::to_owned);
            state.attribution_window = attribution_window;
        }

        self.store
            .set(keys::COMPANY_CODE, company_code.unwrap_or(""))
            .await?;
        if let Some(window) = attribution_window {
            self.store
                .set(keys::ATTRIBUTION_ACTIVE_TIME, &window.as_millis().to_string())
                .await?;
        }
        Ok(true)
    }

    pub fn verbose_logging(&self) -> bool {
        self.state().verbose_logging
    }

    /// Company code from `initialize()`, or the persisted one from a previous run. Empty codes
    /// count as missing.
    pub async fn company_code(&self) -> Result<Option<String>> {
        let cached = self.state().company_code.clone();
        if let Some(code) = cached {
            return Ok(Some(code));
        }
        let stored = self.store.get(keys::COMPANY_CODE).await?;
        Ok(stored.filter(|code| !code.is_empty()))
    }

    pub async fn attribution_window(&self) -> Result<Option<Duration>> {
        let cached = self.state().attribution_window;
        if let Some(window) = cached {
            return Ok(Some(window));
        }
        let Some(stored) = self.store.get(keys::ATTRIBUTION_ACTIVE_TIME).await? else {
            return Ok(None);
        };
        match stored.parse::<u64>() {
            Ok(millis) => Ok(Some(Duration::from_millis(millis))),
            Err(_) => {
                log::warn!(target: "insert_affiliate", stored = stored.as_str(); "ignoring malformed attribution window");
                Ok(None)
            }
        }
    }

    /// Get the persisted device ID, generating and persisting one on first use.
    pub async fn get_or_create_user_id(&self) -> Result<String> {
        if let Some(user_id) = self.store.get(keys::USER_ID).await? {
            return Ok(user_id);
        }
        let user_id = self.id_generator.new_short_device_id();
        self.store.set(keys::USER_ID, &user_id).await?;
        log::debug!(target: "insert_affiliate", user_id = user_id.as_str(); "generated new user id");
        Ok(user_id)
    }

    pub async fn stored_short_code(&self) -> Result<Option<String>> {
        self.store.get(keys::REFERRER_LINK).await
    }

    /// Persist `short_code` as the current affiliation. The timestamp is only refreshed when the
    /// short code differs from the stored one. Returns whether it changed.
    pub async fn record_short_code(&self, short_code: &str) -> Result<bool> {
        if self.stored_short_code().await?.as_deref() == Some(short_code) {
            return Ok(false);
        }
        self.store.set(keys::REFERRER_LINK, short_code).await?;
        self.store
            .set(keys::AFFILIATE_STORED_DATE, &format_timestamp(self.now()))
            .await?;
        Ok(true)
    }

    /// When the current short code was stored. `None` if never stored or unparseable.
    pub async fn stored_date(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(stored) = self.store.get(keys::AFFILIATE_STORED_DATE).await? else {
            return Ok(None);
        };
        let parsed = parse_timestamp(&stored);
        if parsed.is_none() {
            log::warn!(target: "insert_affiliate", stored = stored.as_str(); "malformed affiliate stored date");
        }
        Ok(parsed)
    }

    pub async fn is_attribution_valid(&self) -> Result<bool> {
        let Some(stored_date) = self.stored_date().await? else {
            return Ok(false);
        };
        let Some(window) = self.attribution_window().await? else {
            return Ok(true);
        };
        Ok(is_within_window(stored_date, self.now(), window))
    }

    /// The `{shortCode}-{userId}` identifier, or `None` if there's no affiliation or, unless
    /// `ignore_timeout` is set, the attribution window has passed.
    pub async fn identifier(&self, ignore_timeout: bool) -> Result<Option<String>> {
        let user_id = self.get_or_create_user_id().await?;
        let Some(short_code) = self.stored_short_code().await? else {
            return Ok(None);
        };

        if !ignore_timeout && !self.is_attribution_valid().await? {
            if self.verbose_logging() {
                log::info!(target: "insert_affiliate", short_code = short_code.as_str(); "attribution window expired");
            }
            return Ok(None);
        }

        Ok(Some(compose_identifier(&short_code, &user_id)))
    }

    pub async fn offer_code(&self) -> Result<Option<String>> {
        let cached = self.state().offer_code.clone();
        if let Some(code) = cached {
            return Ok(Some(code));
        }
        self.store.get(keys::OFFER_CODE).await
    }

    pub async fn store_offer_code(&self, code: &str) -> Result<()> {
        self.state_mut().offer_code = Some(code.to_owned());
        self.store.set(keys::OFFER_CODE, code).await
    }

    /// Get the purchase-session token, generating and persisting one on first use.
    pub async fn get_or_create_user_account_token(&self) -> Result<String> {
        if let Some(token) = self.store.get(keys::USER_ACCOUNT_TOKEN).await? {
            return Ok(token);
        }
        let token = self.id_generator.new_unique_token();
        self.store.set(keys::USER_ACCOUNT_TOKEN, &token).await?;
        Ok(token)
    }

    pub fn set_change_callback(&self, callback: Option<Arc<dyn IdentifierChangeCallback>>) {
        self.state_mut().change_callback = callback;
    }

    pub fn notify_identifier_changed(&self, identifier: &str) {
        // Clone out of the lock, so the callback may replace itself.
        let callback = self.state().change_callback.clone();
        if let Some(callback) = callback {
            callback.on_identifier_changed(identifier);
        }
    }
}

/// Whether `value` is already a short code: 3 to 25 ASCII letters or digits.
pub(crate) fn is_short_code(value: &str) -> bool {
    static SHORT_CODE: OnceLock<Regex> = OnceLock::new();
    SHORT_CODE
        .get_or_init(|| Regex::new("^[a-zA-Z0-9]{3,25}$").expect("short code pattern should be valid"))
        .is_match(value)
}

pub(crate) fn compose_identifier(short_code: &str, user_id: &str) -> String {
    format!("{}-{}", short_code, user_id)
}

/// `now - stored_date <= window`. A stored date in the future counts as within the window.
pub(crate) fn is_within_window(
    stored_date: DateTime<Utc>,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    let elapsed = now.signed_duration_since(stored_date).num_milliseconds();
    i128::from(elapsed) <= window.as_millis() as i128
}

pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use chrono::{DateTime, TimeZone, Utc};

    use crate::{hooks::Clock, id_generator::IdGenerator};

    /// A clock that only moves when told to.
    pub(crate) struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn new() -> Self {
            ManualClock(Mutex::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()))
        }

        pub fn advance(&self, by: chrono::Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Hands out `token-1`, `token-2`, ... and always the same device ID.
    pub(crate) struct SequentialIds {
        pub device_id: &'static str,
        device_ids: AtomicUsize,
        tokens: AtomicUsize,
    }

    impl SequentialIds {
        pub fn new(device_id: &'static str) -> Self {
            SequentialIds {
                device_id,
                device_ids: AtomicUsize::new(0),
                tokens: AtomicUsize::new(0),
            }
        }

        pub fn device_ids_generated(&self) -> usize {
            self.device_ids.load(Ordering::SeqCst)
        }
    }

    impl IdGenerator for SequentialIds {
        fn new_unique_token(&self) -> String {
            let n = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
            format!("token-{}", n)
        }

        fn new_short_device_id(&self) -> String {
            self.device_ids.fetch_add(1, Ordering::SeqCst);
            self.device_id.to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use chrono::{TimeZone, Utc};

    use super::{
        compose_identifier, is_short_code, is_within_window,
        test_support::{ManualClock, SequentialIds},
        AttributionEngine,
    };
    use crate::{
        id_generator::RandomIdGenerator,
        identity_store::{keys, IdentityStore, MemoryIdentityStore},
    };

    const DAY: Duration = Duration::from_millis(86_400_000);

    struct Fixture {
        store: Arc<MemoryIdentityStore>,
        ids: Arc<SequentialIds>,
        clock: Arc<ManualClock>,
        engine: AttributionEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryIdentityStore::new());
        let ids = Arc::new(SequentialIds::new("AB12CD"));
        let clock = Arc::new(ManualClock::new());
        let engine = AttributionEngine::new(store.clone(), ids.clone(), clock.clone());
        Fixture {
            store,
            ids,
            clock,
            engine,
        }
    }

    #[test]
    fn short_code_pattern() {
        assert!(is_short_code("abc"));
        assert!(is_short_code("promo1"));
        assert!(is_short_code("A1b2C3d4E5f6G7h8I9j0K1l2M"));

        assert!(!is_short_code("ab"));
        assert!(!is_short_code("A1b2C3d4E5f6G7h8I9j0K1l2M3"));
        assert!(!is_short_code("promo-1"));
        assert!(!is_short_code("https://app.link/abc"));
        assert!(!is_short_code("prómo1"));
        assert!(!is_short_code(""));
    }

    #[test]
    fn identifier_format() {
        assert_eq!(compose_identifier("promo1", "AB12CD"), "promo1-AB12CD");
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let stored = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = Duration::from_secs(60);

        assert!(is_within_window(stored, stored + chrono::Duration::seconds(60), window));
        assert!(!is_within_window(
            stored,
            stored + chrono::Duration::milliseconds(60_001),
            window
        ));
        assert!(is_within_window(stored, stored - chrono::Duration::hours(1), window));
    }

    #[tokio::test]
    async fn user_id_is_generated_once() {
        let f = fixture();

        let first = f.engine.get_or_create_user_id().await.unwrap();
        for _ in 0..5 {
            assert_eq!(f.engine.get_or_create_user_id().await.unwrap(), first);
        }
        assert_eq!(f.ids.device_ids_generated(), 1);
        assert_eq!(f.store.get(keys::USER_ID).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn random_user_id_is_stable() {
        let store = Arc::new(MemoryIdentityStore::new());
        let engine = AttributionEngine::new(
            store,
            Arc::new(RandomIdGenerator),
            Arc::new(ManualClock::new()),
        );

        let first = engine.get_or_create_user_id().await.unwrap();
        assert_eq!(first.len(), 6);
        assert_eq!(engine.get_or_create_user_id().await.unwrap(), first);
    }

    #[tokio::test]
    async fn initialize_is_guarded() {
        let f = fixture();

        assert!(f.engine.initialize(Some("ACME123"), true, Some(DAY)).await.unwrap());
        assert!(!f.engine.initialize(Some("OTHER"), false, None).await.unwrap());

        assert_eq!(f.engine.company_code().await.unwrap().as_deref(), Some("ACME123"));
        assert!(f.engine.verbose_logging());
        assert_eq!(
            f.store.get(keys::COMPANY_CODE).await.unwrap().as_deref(),
            Some("ACME123")
        );
        assert_eq!(
            f.store.get(keys::ATTRIBUTION_ACTIVE_TIME).await.unwrap().as_deref(),
            Some("86400000")
        );
    }

    #[tokio::test]
    async fn initialize_without_company_code_persists_empty_string() {
        let f = fixture();

        f.engine.initialize(None, false, None).await.unwrap();

        assert_eq!(f.store.get(keys::COMPANY_CODE).await.unwrap().as_deref(), Some(""));
        assert_eq!(f.engine.company_code().await.unwrap(), None);
        assert_eq!(f.store.get(keys::ATTRIBUTION_ACTIVE_TIME).await.unwrap(), None);
    }

    #[tokio::test]
    async fn falls_back_to_persisted_configuration() {
        let f = fixture();
        f.store.set(keys::COMPANY_CODE, "ACME123").await.unwrap();
        f.store.set(keys::ATTRIBUTION_ACTIVE_TIME, "1000").await.unwrap();

        assert_eq!(f.engine.company_code().await.unwrap().as_deref(), Some("ACME123"));
        assert_eq!(
            f.engine.attribution_window().await.unwrap(),
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn malformed_persisted_window_means_no_window() {
        let f = fixture();
        f.store.set(keys::ATTRIBUTION_ACTIVE_TIME, "soon").await.unwrap();

        assert_eq!(f.engine.attribution_window().await.unwrap(), None);
    }

    #[tokio::test]
    async fn record_short_code_only_timestamps_changes() {
        let f = fixture();

        assert!(f.engine.record_short_code("promo1").await.unwrap());
        let first_date = f.engine.stored_date().await.unwrap().unwrap();

        f.clock.advance(chrono::Duration::minutes(5));
        assert!(!f.engine.record_short_code("promo1").await.unwrap());
        assert_eq!(f.engine.stored_date().await.unwrap().unwrap(), first_date);

        assert!(f.engine.record_short_code("promo2").await.unwrap());
        assert_eq!(
            f.engine.stored_date().await.unwrap().unwrap(),
            first_date + chrono::Duration::minutes(5)
        );
        assert_eq!(
            f.store.get(keys::REFERRER_LINK).await.unwrap().as_deref(),
            Some("promo2")
        );
    }

    #[tokio::test]
    async fn stored_date_is_iso_8601() {
        let f = fixture();

        f.engine.record_short_code("promo1").await.unwrap();

        assert_eq!(
            f.store.get(keys::AFFILIATE_STORED_DATE).await.unwrap().as_deref(),
            Some("2024-05-01T12:00:00.000Z")
        );
    }

    #[tokio::test]
    async fn attribution_invalid_without_stored_date() {
        let f = fixture();

        assert!(!f.engine.is_attribution_valid().await.unwrap());
    }

    #[tokio::test]
    async fn malformed_stored_date_invalidates_attribution() {
        let f = fixture();
        f.store.set(keys::REFERRER_LINK, "promo1").await.unwrap();
        f.store
            .set(keys::AFFILIATE_STORED_DATE, "not-a-date")
            .await
            .unwrap();

        assert_eq!(f.engine.stored_date().await.unwrap(), None);
        assert!(!f.engine.is_attribution_valid().await.unwrap());
        assert_eq!(f.engine.identifier(false).await.unwrap(), None);
        assert_eq!(
            f.engine.identifier(true).await.unwrap().as_deref(),
            Some("promo1-AB12CD")
        );
    }

    #[tokio::test]
    async fn attribution_without_window_never_expires() {
        let f = fixture();
        f.engine.record_short_code("promo1").await.unwrap();

        f.clock.advance(chrono::Duration::days(3650));

        assert!(f.engine.is_attribution_valid().await.unwrap());
        assert_eq!(
            f.engine.identifier(false).await.unwrap().as_deref(),
            Some("promo1-AB12CD")
        );
    }

    #[tokio::test]
    async fn identifier_expires_after_window() {
        let f = fixture();
        f.engine.initialize(Some("ACME123"), false, Some(DAY)).await.unwrap();
        f.engine.record_short_code("promo1").await.unwrap();

        f.clock.advance(chrono::Duration::hours(24));
        assert_eq!(
            f.engine.identifier(false).await.unwrap().as_deref(),
            Some("promo1-AB12CD")
        );

        f.clock.advance(chrono::Duration::milliseconds(1));
        assert_eq!(f.engine.identifier(false).await.unwrap(), None);
        assert_eq!(
            f.engine.identifier(true).await.unwrap().as_deref(),
            Some("promo1-AB12CD")
        );
        // Expiry withholds the identifier but keeps the affiliation.
        assert_eq!(
            f.engine.stored_short_code().await.unwrap().as_deref(),
            Some("promo1")
        );
    }

    #[tokio::test]
    async fn identifier_is_none_without_affiliation() {
        let f = fixture();

        assert_eq!(f.engine.identifier(true).await.unwrap(), None);
        // The user id is still created.
        assert_eq!(
            f.store.get(keys::USER_ID).await.unwrap().as_deref(),
            Some("AB12CD")
        );
    }

    #[tokio::test]
    async fn offer_code_prefers_cache_then_store() {
        let f = fixture();
        assert_eq!(f.engine.offer_code().await.unwrap(), None);

        f.store.set(keys::OFFER_CODE, "PERSISTED").await.unwrap();
        assert_eq!(f.engine.offer_code().await.unwrap().as_deref(), Some("PERSISTED"));

        f.engine.store_offer_code("FRESH").await.unwrap();
        assert_eq!(f.engine.offer_code().await.unwrap().as_deref(), Some("FRESH"));
        assert_eq!(f.store.get(keys::OFFER_CODE).await.unwrap().as_deref(), Some("FRESH"));
    }

    #[tokio::test]
    async fn user_account_token_is_created_once() {
        let f = fixture();

        let token = f.engine.get_or_create_user_account_token().await.unwrap();
        assert_eq!(token, "token-1");
        assert_eq!(f.engine.get_or_create_user_account_token().await.unwrap(), token);
    }

    #[test]
    fn callback_slot_holds_one_callback() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        f.engine.set_change_callback(Some(Arc::new(move |id: &str| {
            first.lock().unwrap().push(format!("first:{}", id))
        })));
        let second = seen.clone();
        f.engine.set_change_callback(Some(Arc::new(move |id: &str| {
            second.lock().unwrap().push(format!("second:{}", id))
        })));
        f.engine.notify_identifier_changed("promo1-AB12CD");

        f.engine.set_change_callback(None);
        f.engine.notify_identifier_changed("promo2-AB12CD");

        assert_eq!(*seen.lock().unwrap(), vec!["second:promo1-AB12CD".to_owned()]);
    }
}
