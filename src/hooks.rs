use chrono::{DateTime, Utc};

/// Notified whenever the resolved affiliate identifier changes.
///
/// Closures taking `&str` implement this trait, so a callback can be registered directly:
///
/// ```
/// # use insert_affiliate::IdentifierChangeCallback;
/// fn takes_callback(_: impl IdentifierChangeCallback) {}
/// takes_callback(|identifier: &str| println!("new affiliate identifier: {}", identifier));
/// ```
pub trait IdentifierChangeCallback: Send + Sync {
    /// Called with the new `{shortCode}-{userId}` identifier.
    fn on_identifier_changed(&self, identifier: &str);
}

impl<T: Fn(&str) + Send + Sync> IdentifierChangeCallback for T {
    fn on_identifier_changed(&self, identifier: &str) {
        self(identifier);
    }
}

/// Opens offer-code redeem URLs on behalf of the SDK.
pub trait UrlOpener: Send + Sync {
    /// Navigate to `url`.
    fn open_url(&self, url: &str);
}

/// Default opener for hosts without a way to open URLs. Only logs the URL.
pub(crate) struct LoggingUrlOpener;

impl UrlOpener for LoggingUrlOpener {
    fn open_url(&self, url: &str) {
        log::info!(target: "insert_affiliate", url; "no URL opener configured, not opening redeem URL");
    }
}

impl<T: Fn(&str) + Send + Sync> UrlOpener for T {
    fn open_url(&self, url: &str) {
        self(url);
    }
}

/// Source of the current time for attribution timestamps and window checks.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<T: Clock + ?Sized> Clock for std::sync::Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
