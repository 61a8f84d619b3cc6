//! Iaptic purchase-validation payloads.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Store platform the host app runs on. Decides how receipts are submitted for validation and
/// which redeem URL is opened for offer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Apple App Store.
    Ios,
    /// Google Play.
    Android,
}

impl Platform {
    /// The platform this crate was compiled for. Everything that is not iOS is treated as Android.
    pub const fn current() -> Platform {
        if cfg!(target_os = "ios") {
            Platform::Ios
        } else {
            Platform::Android
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::current()
    }
}

/// Fields of a Google Play receipt, after base64-decoding the transaction receipt.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AndroidReceipt {
    order_id: String,
    purchase_token: String,
    signature: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct IosTransaction {
    id: String,
    #[serde(rename = "appStoreReceipt")]
    app_store_receipt: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AndroidTransaction {
    id: String,
    purchase_token: String,
    receipt: String,
    signature: String,
}

#[derive(Debug, Serialize, PartialEq, From)]
#[serde(tag = "type")]
pub(crate) enum Transaction {
    #[serde(rename = "ios-appstore")]
    IosAppStore(IosTransaction),
    #[serde(rename = "android-playstore")]
    AndroidPlayStore(AndroidTransaction),
}

impl Transaction {
    /// Build the platform-specific transaction descriptor for `receipt`.
    ///
    /// On Android, `receipt` must be base64-encoded JSON with `orderId`, `purchaseToken`, and
    /// `signature` fields.
    pub fn from_receipt(platform: Platform, receipt: &str, app_id: &str) -> Result<Transaction> {
        match platform {
            Platform::Ios => Ok(IosTransaction {
                id: app_id.to_owned(),
                app_store_receipt: receipt.to_owned(),
            }
            .into()),
            Platform::Android => {
                let decoded = STANDARD.decode(receipt)?;
                let android: AndroidReceipt = serde_json::from_slice(&decoded)?;
                Ok(AndroidTransaction {
                    id: android.order_id,
                    purchase_token: android.purchase_token,
                    receipt: receipt.to_owned(),
                    signature: android.signature,
                }
                .into())
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AdditionalData {
    pub application_username: String,
}

/// Body of `POST /v1/validate`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ValidationRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub transaction: Transaction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<AdditionalData>,
}

impl ValidationRequest {
    pub fn new(
        app_id: &str,
        transaction: Transaction,
        affiliate_identifier: Option<String>,
    ) -> ValidationRequest {
        ValidationRequest {
            id: app_id.to_owned(),
            kind: "application",
            transaction,
            additional_data: affiliate_identifier.map(|identifier| AdditionalData {
                application_username: identifier,
            }),
        }
    }
}

/// `Authorization` header value for Iaptic: `Basic base64(appName:publicKey)`.
pub(crate) fn basic_authorization(app_name: &str, public_key: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", app_name, public_key))
    )
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde_json::json;

    use super::{basic_authorization, Platform, Transaction, ValidationRequest};

    #[test]
    fn ios_transaction_carries_raw_receipt() {
        let transaction = Transaction::from_receipt(Platform::Ios, "MIIT...", "com.app").unwrap();
        let request = ValidationRequest::new("com.app", transaction, Some("promo1-AB12CD".into()));

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "id": "com.app",
                "type": "application",
                "transaction": {
                    "id": "com.app",
                    "type": "ios-appstore",
                    "appStoreReceipt": "MIIT...",
                },
                "additionalData": { "applicationUsername": "promo1-AB12CD" },
            })
        );
    }

    #[test]
    fn android_transaction_is_decoded_from_receipt() {
        let receipt = STANDARD.encode(
            json!({
                "orderId": "GPA.1234",
                "purchaseToken": "token-abc",
                "signature": "sig==",
            })
            .to_string(),
        );

        let transaction =
            Transaction::from_receipt(Platform::Android, &receipt, "com.app").unwrap();
        let request = ValidationRequest::new("com.app", transaction, None);

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "id": "com.app",
                "type": "application",
                "transaction": {
                    "id": "GPA.1234",
                    "type": "android-playstore",
                    "purchaseToken": "token-abc",
                    "receipt": receipt,
                    "signature": "sig==",
                },
            })
        );
    }

    #[test]
    fn malformed_android_receipt_is_an_error() {
        assert!(Transaction::from_receipt(Platform::Android, "%%%", "com.app").is_err());

        let not_json = STANDARD.encode("plain text");
        assert!(Transaction::from_receipt(Platform::Android, &not_json, "com.app").is_err());
    }

    #[test]
    fn basic_authorization_encodes_name_and_key() {
        assert_eq!(
            basic_authorization("my-app", "public-key"),
            format!("Basic {}", STANDARD.encode("my-app:public-key"))
        );
    }
}
