use std::sync::Arc;

use crate::{
    hooks::{LoggingUrlOpener, SystemClock},
    id_generator::RandomIdGenerator,
    transport::ReqwestTransport,
    Client, Clock, HttpTransport, IdGenerator, IdentityStore, Platform, UrlOpener,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use insert_affiliate::{ClientConfig, MemoryIdentityStore, Platform};
/// let client = ClientConfig::new(MemoryIdentityStore::new())
///     .platform(Platform::Ios)
///     .url_opener(|url: &str| println!("open {}", url))
///     .to_client();
/// ```
pub struct ClientConfig {
    pub(crate) store: Arc<dyn IdentityStore>,
    pub(crate) base_url: String,
    pub(crate) validator_url: String,
    pub(crate) platform: Platform,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) id_generator: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) url_opener: Arc<dyn UrlOpener>,
}

impl ClientConfig {
    /// Default base URL for Insert Affiliate API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://api.insertaffiliate.com";

    /// Default base URL for Iaptic purchase validation.
    pub const DEFAULT_VALIDATOR_URL: &'static str = "https://validator.iaptic.com";

    /// Create a default configuration persisting state in `store`.
    ///
    /// ```
    /// # use insert_affiliate::{ClientConfig, JsonFileIdentityStore};
    /// ClientConfig::new(JsonFileIdentityStore::new("insert-affiliate.json"));
    /// ```
    pub fn new(store: impl IdentityStore + 'static) -> Self {
        ClientConfig {
            store: Arc::new(store),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            validator_url: ClientConfig::DEFAULT_VALIDATOR_URL.to_owned(),
            platform: Platform::current(),
            transport: Arc::new(ReqwestTransport::new()),
            id_generator: Arc::new(RandomIdGenerator),
            clock: Arc::new(SystemClock),
            url_opener: Arc::new(LoggingUrlOpener),
        }
    }

    /// Override base URL for Insert Affiliate API calls. Clients should use the default setting
    /// in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override base URL for purchase validation.
    pub fn validator_url(mut self, validator_url: impl Into<String>) -> Self {
        self.validator_url = validator_url.into();
        self
    }

    /// Set the store platform. Defaults to [`Platform::current()`].
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Replace the HTTP transport, e.g., to use a preconfigured `reqwest::Client`.
    pub fn transport(mut self, transport: impl HttpTransport + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Replace the generator for device IDs and purchase tokens.
    pub fn id_generator(mut self, id_generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Arc::new(id_generator);
        self
    }

    /// Replace the clock used for attribution timestamps.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Set the handler that opens offer-code redeem URLs. By default, URLs are only logged.
    pub fn url_opener(mut self, url_opener: impl UrlOpener + 'static) -> Self {
        self.url_opener = Arc::new(url_opener);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use insert_affiliate::{Client, ClientConfig, MemoryIdentityStore};
    /// let client: Client = ClientConfig::new(MemoryIdentityStore::new()).to_client();
    /// ```
    pub fn to_client(self) -> Client {
        Client::new(self)
    }
}
