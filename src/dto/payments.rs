use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result code the gateway sends for a completed payment.
pub const RESULT_SUCCESS: i64 = 0;

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: Option<String>,
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub item: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Option<serde_json::Value>,
}

impl StkCallback {
    /// Metadata lookup by item name. The gateway does not guarantee item
    /// ordering, so positional indexing is never safe here.
    pub fn metadata_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.callback_metadata
            .as_ref()?
            .item
            .iter()
            .find(|item| item.name.eq_ignore_ascii_case(name))?
            .value
            .as_ref()
    }

    /// The order reference echoed back as the account identifier.
    pub fn account_reference(&self) -> Option<String> {
        match self.metadata_value("AccountReference")? {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Envelope the gateway expects back from the callback endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Callback processed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_payload() -> StkCallbackEnvelope {
        // Metadata deliberately ordered with AccountReference last.
        serde_json::from_value(serde_json::json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 350.0},
                            {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                            {"Name": "PhoneNumber", "Value": 254712345678u64},
                            {"Name": "AccountReference", "Value": "ORD-6f9619ff8b86d011b42d00c04fc964ff"}
                        ]
                    }
                }
            }
        }))
        .expect("valid callback payload")
    }

    #[test]
    fn account_reference_found_by_name_not_position() {
        let callback = success_payload().body.stk_callback;
        assert_eq!(
            callback.account_reference().as_deref(),
            Some("ORD-6f9619ff8b86d011b42d00c04fc964ff")
        );
    }

    #[test]
    fn numeric_metadata_values_coerce_to_strings() {
        let callback = success_payload().body.stk_callback;
        let phone = callback.metadata_value("PhoneNumber").unwrap();
        assert_eq!(phone.to_string(), "254712345678");
    }

    #[test]
    fn cancellation_callback_has_no_reference() {
        let envelope: StkCallbackEnvelope = serde_json::from_value(serde_json::json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-2",
                    "CheckoutRequestID": "ws_CO_191220191020363926",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        }))
        .expect("valid cancellation payload");

        let callback = envelope.body.stk_callback;
        assert_eq!(callback.result_code, 1032);
        assert!(callback.account_reference().is_none());
        assert_eq!(
            callback.checkout_request_id.as_deref(),
            Some("ws_CO_191220191020363926")
        );
    }
}
