//! Thin wrappers around the Insert Affiliate and Iaptic HTTP endpoints.
//!
//! Functions here don't know about the device identity or the attribution window; the
//! [`Client`](crate::Client) decides what to send and how to treat failures.
use std::sync::{Arc, OnceLock};

use regex::Regex;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::{
    purchase::ValidationRequest,
    transport::{HttpRequest, HttpTransport},
    Error, Result,
};

const SHORT_LINK_ENDPOINT: &[&str] = &["V1", "convert-deep-link-to-short-link"];
const OFFER_CODE_ENDPOINT: &[&str] = &["v1", "affiliateReturnOfferCode"];
const TRACK_EVENT_ENDPOINT: &[&str] = &["v1", "trackEvent"];
const EXPECTED_TRANSACTION_ENDPOINT: &[&str] =
    &["v1", "api", "app-store-webhook", "create-expected-transaction"];
const VALIDATE_ENDPOINT: &[&str] = &["v1", "validate"];

/// Plain-text bodies (after stripping non-alphanumerics) the offer-code endpoint uses to say
/// "not found" with a success status.
const OFFER_CODE_NOT_FOUND: &[&str] = &[
    "errorofferCodeNotFound",
    "errorAffiliateoffercodenotfoundinanycompany",
    "errorAffiliateoffercodenotfoundinanycompanyAffiliatelinkwas",
    "Routenotfound",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShortLinkResponse {
    short_link: Option<String>,
}

/// Body of `POST /v1/trackEvent`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrackEventRequest<'a> {
    pub event_name: &'a str,
    pub deep_link_param: &'a str,
    pub company_id: &'a str,
}

/// Body of `POST /v1/api/app-store-webhook/create-expected-transaction`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExpectedTransactionRequest<'a> {
    #[serde(rename = "UUID")]
    pub uuid: &'a str,
    pub company_code: &'a str,
    pub short_code: &'a str,
    pub stored_date: String,
}

pub(crate) struct RemoteAttributionClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    validator_url: String,
}

impl RemoteAttributionClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: String,
        validator_url: String,
    ) -> RemoteAttributionClient {
        RemoteAttributionClient {
            transport,
            base_url,
            validator_url,
        }
    }

    /// Exchange a full deep link for its short code. Returns `None` if the server knows no
    /// short link for it.
    pub async fn fetch_short_link(
        &self,
        company_code: &str,
        deep_link: &str,
    ) -> Result<Option<String>> {
        let mut url = endpoint(&self.base_url, SHORT_LINK_ENDPOINT)?;
        url.query_pairs_mut()
            .append_pair("companyId", company_code)
            .append_pair("deepLinkUrl", deep_link);

        let response = self.transport.send(HttpRequest::get(url)).await?;
        if !response.status.is_success() {
            return Err(Error::UnexpectedStatus(response.status));
        }

        let body: ShortLinkResponse = response.json()?;
        Ok(body.short_link.filter(|link| !link.is_empty()))
    }

    /// Look up the offer code for `short_code` within `company_code`.
    pub async fn fetch_offer_code(
        &self,
        company_code: &str,
        short_code: &str,
    ) -> Result<Option<String>> {
        let mut url = endpoint(&self.base_url, OFFER_CODE_ENDPOINT)?;
        push_segments(&mut url, &[company_code, short_code])?;
        self.fetch_offer_code_at(url).await
    }

    /// Look up the offer code by the raw affiliate link, without company scoping.
    pub async fn fetch_offer_code_by_link(&self, affiliate_link: &str) -> Result<Option<String>> {
        let mut url = endpoint(&self.base_url, OFFER_CODE_ENDPOINT)?;
        push_segments(&mut url, &[affiliate_link])?;
        self.fetch_offer_code_at(url).await
    }

    async fn fetch_offer_code_at(&self, url: Url) -> Result<Option<String>> {
        let response = self.transport.send(HttpRequest::get(url)).await?;
        if !response.status.is_success() {
            log::debug!(target: "insert_affiliate", "offer code lookup returned {}", response.status);
            return Ok(None);
        }
        Ok(clean_offer_code(&response.body))
    }

    pub async fn track_event(&self, request: &TrackEventRequest<'_>) -> Result<StatusCode> {
        let url = endpoint(&self.base_url, TRACK_EVENT_ENDPOINT)?;
        let response = self
            .transport
            .send(HttpRequest::post_json(url, serde_json::to_value(request)?))
            .await?;
        Ok(response.status)
    }

    pub async fn create_expected_transaction(
        &self,
        request: &ExpectedTransactionRequest<'_>,
    ) -> Result<StatusCode> {
        let url = endpoint(&self.base_url, EXPECTED_TRANSACTION_ENDPOINT)?;
        let response = self
            .transport
            .send(HttpRequest::post_json(url, serde_json::to_value(request)?))
            .await?;
        Ok(response.status)
    }

    pub async fn validate_purchase(
        &self,
        request: &ValidationRequest,
        authorization: String,
    ) -> Result<StatusCode> {
        let url = endpoint(&self.validator_url, VALIDATE_ENDPOINT)?;
        let response = self
            .transport
            .send(
                HttpRequest::post_json(url, serde_json::to_value(request)?)
                    .with_authorization(authorization),
            )
            .await?;
        Ok(response.status)
    }
}

/// Strip everything but ASCII letters and digits from an offer-code response body. Returns `None`
/// for empty bodies and "not found" sentinels.
pub(crate) fn clean_offer_code(body: &str) -> Option<String> {
    static NON_ALPHANUMERIC: OnceLock<Regex> = OnceLock::new();
    let re = NON_ALPHANUMERIC
        .get_or_init(|| Regex::new("[^a-zA-Z0-9]").expect("offer code filter should be valid"));

    let code = re.replace_all(body, "");
    if code.is_empty() || OFFER_CODE_NOT_FOUND.contains(&code.as_ref()) {
        return None;
    }
    Some(code.into_owned())
}

fn endpoint(base_url: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base_url).map_err(Error::InvalidBaseUrl)?;
    push_segments(&mut url, segments)?;
    Ok(url)
}

/// Append percent-encoded path segments. A `/` inside a segment is encoded, not treated as a
/// separator.
fn push_segments(url: &mut Url, segments: &[&str]) -> Result<()> {
    url.path_segments_mut()
        .map_err(|()| Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .extend(segments);
    Ok(())
}
