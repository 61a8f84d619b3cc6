use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use tokio::task::JoinHandle;

use crate::{
    engine::{compose_identifier, format_timestamp, is_short_code, AttributionEngine},
    purchase::{basic_authorization, Transaction, ValidationRequest},
    remote::{ExpectedTransactionRequest, RemoteAttributionClient, TrackEventRequest},
    ClientConfig, IdentifierChangeCallback, Platform, Result, UrlOpener,
};

const APP_STORE_REDEEM_URL: &str = "https://apps.apple.com/redeem";
const PLAY_STORE_REDEEM_URL: &str = "https://play.google.com/redeem";

/// A client for the Insert Affiliate API.
///
/// The client is cheap to clone; clones share the same state. None of its methods return errors:
/// failures are logged under the `insert_affiliate` target and reported as `None`/`false`.
///
/// # Examples
/// ```no_run
/// # use std::time::Duration;
/// # use insert_affiliate::{ClientConfig, JsonFileIdentityStore};
/// # async fn run() {
/// let client = ClientConfig::new(JsonFileIdentityStore::new("insert-affiliate.json")).to_client();
/// client
///     .initialize(Some("ACME123"), false, Some(Duration::from_secs(7 * 24 * 60 * 60)))
///     .await;
///
/// client.set_insert_affiliate_identifier("https://myapp.link/promo").await;
/// client.track_event("signup").await;
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    engine: AttributionEngine,
    remote: RemoteAttributionClient,
    platform: Platform,
    url_opener: Arc<dyn UrlOpener>,
}

/// Result of changing the affiliate identifier, with a handle to the detached offer-code prefetch
/// so tests can wait for it.
pub(crate) struct IdentifierUpdate {
    pub identifier: String,
    pub offer_code_prefetch: Option<JoinHandle<()>>,
}

macro_rules! verbose {
    ($client:expr, $($arg:tt)+) => {
        if $client.inner.engine.verbose_logging() {
            log::info!(target: "insert_affiliate", $($arg)+);
        }
    };
}

/// Log a failed operation and turn it into `None`.
fn best_effort<T>(operation: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            log::error!(target: "insert_affiliate", operation; "operation failed: {}", err);
            None
        }
    }
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// ```
    /// # use insert_affiliate::{Client, ClientConfig, MemoryIdentityStore};
    /// let client = Client::new(ClientConfig::new(MemoryIdentityStore::new()));
    /// ```
    pub fn new(config: ClientConfig) -> Self {
        let engine = AttributionEngine::new(config.store, config.id_generator, config.clock);
        let remote =
            RemoteAttributionClient::new(config.transport, config.base_url, config.validator_url);
        Client {
            inner: Arc::new(ClientInner {
                engine,
                remote,
                platform: config.platform,
                url_opener: config.url_opener,
            }),
        }
    }

    /// Set the company code, verbose logging, and the attribution window.
    ///
    /// Only the first call on a client has an effect. Without an `attribution_window`,
    /// attribution never expires (unless a window persisted by a previous run is found).
    pub async fn initialize(
        &self,
        company_code: Option<&str>,
        verbose_logging: bool,
        attribution_window: Option<Duration>,
    ) {
        let result = self
            .inner
            .engine
            .initialize(company_code, verbose_logging, attribution_window)
            .await;
        match result {
            Ok(true) => match company_code {
                Some(company_code) if !company_code.is_empty() => {
                    log::info!(target: "insert_affiliate", company_code; "SDK initialized with company code");
                }
                _ => log::info!(target: "insert_affiliate", "SDK initialized without a company code"),
            },
            Ok(false) => log::warn!(target: "insert_affiliate", "SDK already initialized"),
            Err(err) => {
                log::error!(target: "insert_affiliate", "failed to persist SDK configuration: {}", err)
            }
        }
    }

    /// The persistent 6-character device ID, created on first use.
    pub async fn get_or_create_user_id(&self) -> Option<String> {
        best_effort(
            "get_or_create_user_id",
            self.inner.engine.get_or_create_user_id().await,
        )
    }

    /// Associate this device with the affiliate behind `referring_link`.
    ///
    /// `referring_link` is used as-is if it looks like a short code (3 to 25 letters or digits);
    /// otherwise it is exchanged for a short code via the API. Returns the resulting
    /// `{shortCode}-{userId}` identifier.
    ///
    /// When the short code changes, the attribution timestamp is reset, the change callback is
    /// invoked, and the affiliate's offer code is fetched in the background. The returned value
    /// does not wait for that fetch.
    pub async fn set_insert_affiliate_identifier(&self, referring_link: &str) -> Option<String> {
        let update = self.update_insert_affiliate_identifier(referring_link).await;
        best_effort("set_insert_affiliate_identifier", update)
            .flatten()
            .map(|update| update.identifier)
    }

    pub(crate) async fn update_insert_affiliate_identifier(
        &self,
        referring_link: &str,
    ) -> Result<Option<IdentifierUpdate>> {
        let engine = &self.inner.engine;
        let user_id = engine.get_or_create_user_id().await?;

        let Some(short_code) = self.resolve_short_code(referring_link).await? else {
            log::warn!(target: "insert_affiliate", referring_link; "could not resolve short code");
            return Ok(None);
        };
        let identifier = compose_identifier(&short_code, &user_id);

        if !engine.record_short_code(&short_code).await? {
            verbose!(self, short_code = short_code.as_str(); "short code unchanged");
            return Ok(Some(IdentifierUpdate {
                identifier,
                offer_code_prefetch: None,
            }));
        }

        verbose!(self, short_code = short_code.as_str(); "stored new short code");
        let offer_code_prefetch = self.spawn_offer_code_prefetch(short_code);
        engine.notify_identifier_changed(&identifier);

        Ok(Some(IdentifierUpdate {
            identifier,
            offer_code_prefetch,
        }))
    }

    async fn resolve_short_code(&self, referring_link: &str) -> Result<Option<String>> {
        if is_short_code(referring_link) {
            return Ok(Some(referring_link.to_owned()));
        }

        let Some(company_code) = self.inner.engine.company_code().await? else {
            log::warn!(target: "insert_affiliate", "cannot resolve a deep link without a company code");
            return Ok(None);
        };

        verbose!(self, referring_link; "exchanging deep link for a short code");
        match self
            .inner
            .remote
            .fetch_short_link(&company_code, referring_link)
            .await
        {
            Ok(short_link) => Ok(short_link),
            Err(err) => {
                log::error!(target: "insert_affiliate", "failed to fetch short link: {}", err);
                Ok(None)
            }
        }
    }

    fn spawn_offer_code_prefetch(&self, short_code: String) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!(target: "insert_affiliate", "no async runtime, skipping offer code prefetch");
            return None;
        };

        let client = self.clone();
        Some(runtime.spawn(async move {
            if let Err(err) = client.fetch_and_store_offer_code(&short_code).await {
                log::debug!(target: "insert_affiliate", "offer code prefetch failed: {}", err);
            }
        }))
    }

    /// Fetch the offer code for `short_code` and remember it. Returns the stored code.
    pub(crate) async fn fetch_and_store_offer_code(&self, short_code: &str) -> Result<Option<String>> {
        let engine = &self.inner.engine;
        let Some(company_code) = engine.company_code().await? else {
            verbose!(self, "no company code, skipping offer code lookup");
            return Ok(None);
        };

        let Some(offer_code) = self
            .inner
            .remote
            .fetch_offer_code(&company_code, short_code)
            .await?
        else {
            log::warn!(target: "insert_affiliate", short_code; "offer code not found");
            return Ok(None);
        };

        engine.store_offer_code(&offer_code).await?;
        verbose!(self, offer_code = offer_code.as_str(); "stored offer code");
        Ok(Some(offer_code))
    }

    /// Set the affiliate identifier from a short code entered by the user. Invalid codes are
    /// logged and ignored.
    pub async fn set_short_code(&self, short_code: &str) {
        if !is_short_code(short_code) {
            log::warn!(target: "insert_affiliate", short_code; "invalid short code, expected 3 to 25 letters or digits");
            return;
        }
        self.set_insert_affiliate_identifier(short_code).await;
    }

    /// The current `{shortCode}-{userId}` identifier.
    ///
    /// Returns `None` if no affiliate has been set or, unless `ignore_timeout` is `true`, the
    /// attribution window has passed. Expiry does not clear the stored affiliation.
    pub async fn return_insert_affiliate_identifier(&self, ignore_timeout: bool) -> Option<String> {
        let identifier = self.inner.engine.identifier(ignore_timeout).await;
        best_effort("return_insert_affiliate_identifier", identifier).flatten()
    }

    /// Whether the stored affiliation is still within the attribution window. `false` if no
    /// affiliate has been set; always `true` otherwise when no window is configured.
    pub async fn is_affiliate_attribution_valid(&self) -> bool {
        let valid = self.inner.engine.is_attribution_valid().await;
        best_effort("is_affiliate_attribution_valid", valid).unwrap_or(false)
    }

    /// When the current affiliate was set.
    pub async fn get_affiliate_stored_date(&self) -> Option<DateTime<Utc>> {
        let stored_date = self.inner.engine.stored_date().await;
        best_effort("get_affiliate_stored_date", stored_date).flatten()
    }

    /// Offer code fetched for the current affiliate, if any.
    pub async fn get_offer_code(&self) -> Option<String> {
        let offer_code = self.inner.engine.offer_code().await;
        best_effort("get_offer_code", offer_code).flatten()
    }

    /// Register a callback for affiliate identifier changes, replacing any previous one. `None`
    /// removes the callback.
    ///
    /// The callback runs synchronously inside [`Client::set_insert_affiliate_identifier`], once
    /// per actual change of the short code.
    pub fn set_insert_affiliate_identifier_change_callback(
        &self,
        callback: Option<Box<dyn IdentifierChangeCallback>>,
    ) {
        self.inner
            .engine
            .set_change_callback(callback.map(Arc::from));
    }

    /// Report a custom event for the current affiliate. Does nothing without a valid affiliate
    /// identifier or a company code.
    pub async fn track_event(&self, event_name: &str) {
        if let Err(err) = self.try_track_event(event_name).await {
            log::error!(target: "insert_affiliate", event_name; "failed to track event: {}", err);
        }
    }

    async fn try_track_event(&self, event_name: &str) -> Result<()> {
        let engine = &self.inner.engine;
        let Some(identifier) = engine.identifier(false).await? else {
            log::warn!(target: "insert_affiliate", event_name; "no affiliate identifier found, not tracking event");
            return Ok(());
        };
        let Some(company_code) = engine.company_code().await? else {
            log::warn!(target: "insert_affiliate", event_name; "no company code, not tracking event");
            return Ok(());
        };

        let status = self
            .inner
            .remote
            .track_event(&TrackEventRequest {
                event_name,
                deep_link_param: &identifier,
                company_id: &company_code,
            })
            .await?;

        if status.is_success() {
            verbose!(self, event_name; "event tracked");
        } else {
            log::warn!(target: "insert_affiliate", event_name; "failed to track event, status {}", status);
        }
        Ok(())
    }

    /// Get (or create) the purchase-session token and register it as an expected transaction.
    ///
    /// Returns `None` if there is no valid affiliate identifier. Pass the token to the store as
    /// the app account token so the purchase can be matched to the affiliate.
    pub async fn return_user_account_token_and_store_expected_transaction(&self) -> Option<String> {
        let engine = &self.inner.engine;
        let identifier = best_effort(
            "return_user_account_token_and_store_expected_transaction",
            engine.identifier(false).await,
        )
        .flatten();
        if identifier.is_none() {
            log::warn!(target: "insert_affiliate", "no affiliate identifier found, not creating a user account token");
            return None;
        }

        let token = best_effort(
            "return_user_account_token_and_store_expected_transaction",
            engine.get_or_create_user_account_token().await,
        )?;
        self.store_expected_store_transaction(&token).await;
        Some(token)
    }

    /// Register `user_account_token` as an expected store transaction for the current affiliate.
    pub async fn store_expected_store_transaction(&self, user_account_token: &str) {
        match self.try_store_expected_store_transaction(user_account_token).await {
            Ok(Some(status)) if status == StatusCode::OK => {
                verbose!(self, "stored expected transaction");
            }
            Ok(Some(status)) => {
                log::warn!(target: "insert_affiliate", "failed storing expected transaction, status {}", status);
            }
            Ok(None) => {
                log::error!(target: "insert_affiliate", "missing company code or affiliate identifier, not storing expected transaction");
            }
            Err(err) => {
                log::error!(target: "insert_affiliate", "error storing expected transaction: {}", err);
            }
        }
    }

    async fn try_store_expected_store_transaction(
        &self,
        user_account_token: &str,
    ) -> Result<Option<StatusCode>> {
        let engine = &self.inner.engine;
        let Some(company_code) = engine.company_code().await? else {
            return Ok(None);
        };
        let Some(identifier) = engine.identifier(false).await? else {
            return Ok(None);
        };

        let request = ExpectedTransactionRequest {
            uuid: user_account_token,
            company_code: &company_code,
            short_code: &identifier,
            stored_date: format_timestamp(engine.now()),
        };
        let status = self.inner.remote.create_expected_transaction(&request).await?;
        Ok(Some(status))
    }

    /// Validate a purchase receipt with Iaptic, tagging it with the current affiliate identifier.
    ///
    /// On iOS, `transaction_receipt` is the raw App Store receipt. On Android, it is the
    /// base64-encoded Google Play purchase JSON. Returns `true` iff Iaptic answered `200 OK`.
    pub async fn validate_purchase_with_iaptic_api(
        &self,
        transaction_receipt: &str,
        iaptic_app_id: &str,
        iaptic_app_name: &str,
        iaptic_public_key: &str,
    ) -> bool {
        let result = self
            .try_validate_purchase(
                transaction_receipt,
                iaptic_app_id,
                iaptic_app_name,
                iaptic_public_key,
            )
            .await;
        match result {
            Ok(status) if status == StatusCode::OK => {
                verbose!(self, "purchase validated");
                true
            }
            Ok(status) => {
                log::warn!(target: "insert_affiliate", "purchase validation rejected, status {}", status);
                false
            }
            Err(err) => {
                log::error!(target: "insert_affiliate", "purchase validation failed: {}", err);
                false
            }
        }
    }

    async fn try_validate_purchase(
        &self,
        transaction_receipt: &str,
        iaptic_app_id: &str,
        iaptic_app_name: &str,
        iaptic_public_key: &str,
    ) -> Result<StatusCode> {
        let transaction =
            Transaction::from_receipt(self.inner.platform, transaction_receipt, iaptic_app_id)?;
        let identifier = self.inner.engine.identifier(false).await?;
        let request = ValidationRequest::new(iaptic_app_id, transaction, identifier);

        self.inner
            .remote
            .validate_purchase(
                &request,
                basic_authorization(iaptic_app_name, iaptic_public_key),
            )
            .await
    }

    /// Look up the offer code for `affiliate_link` and, if there is one, open the store's redeem
    /// page through the configured [`UrlOpener`].
    ///
    /// `offer_code_url_id` is the App Store app ID used in the iOS redeem URL.
    pub async fn fetch_and_conditionally_open_url(
        &self,
        affiliate_link: &str,
        offer_code_url_id: &str,
    ) {
        let offer_code = match self.inner.remote.fetch_offer_code_by_link(affiliate_link).await {
            Ok(Some(offer_code)) => offer_code,
            Ok(None) => {
                log::warn!(target: "insert_affiliate", affiliate_link; "offer code not found");
                return;
            }
            Err(err) => {
                log::error!(target: "insert_affiliate", "error fetching offer code: {}", err);
                return;
            }
        };

        match redeem_url(self.inner.platform, offer_code_url_id, &offer_code) {
            Ok(url) => {
                verbose!(self, url = url.as_str(); "opening offer code redeem URL");
                self.inner.url_opener.open_url(url.as_str());
            }
            Err(err) => {
                log::error!(target: "insert_affiliate", "failed to build redeem URL: {}", err);
            }
        }
    }
}

fn redeem_url(platform: Platform, offer_code_url_id: &str, offer_code: &str) -> Result<Url> {
    let url = match platform {
        Platform::Ios => Url::parse_with_params(
            APP_STORE_REDEEM_URL,
            &[
                ("ctx", "offercodes"),
                ("id", offer_code_url_id),
                ("code", offer_code),
            ],
        ),
        Platform::Android => Url::parse_with_params(PLAY_STORE_REDEEM_URL, &[("code", offer_code)]),
    };
    url.map_err(crate::Error::InvalidBaseUrl)
}
