//! Allocation API response envelope

use serde_json::Value;

use crate::error::ExportError;

/// HTTP-level success code the API embeds in its body
const SUCCESS_CODE: i64 = 200;

/// Decoded `{code, data, message}` envelope with `data` kept as a generic tree
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationResponse {
    pub code: i64,
    pub message: Option<String>,
    pub data: Value,
}

impl AllocationResponse {
    /// Decode a response body and reject non-success codes
    pub fn from_slice(body: &[u8]) -> Result<Self, ExportError> {
        let response = Self::decode(body)?;
        if response.code != SUCCESS_CODE {
            return Err(ExportError::Api {
                code: response.code,
                message: response
                    .message
                    .unwrap_or_else(|| "no message from upstream".to_string()),
            });
        }
        Ok(response)
    }

    /// Decode the envelope without judging its status code
    pub(crate) fn decode(body: &[u8]) -> Result<Self, ExportError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ExportError::Transport(
                "allocation API returned an empty body".to_string(),
            ));
        }

        let mut root: Value = serde_json::from_slice(body).map_err(|e| {
            ExportError::Transport(format!("undecodable allocation response: {}", e))
        })?;

        let envelope = root.as_object_mut().ok_or_else(|| {
            ExportError::Transport("allocation response is not a JSON object".to_string())
        })?;

        let code = envelope
            .get("code")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ExportError::Transport("allocation response carries no status code".to_string())
            })?;

        let message = envelope
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let data = envelope.remove("data").unwrap_or(Value::Null);

        Ok(Self {
            code,
            message,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope() {
        let response =
            AllocationResponse::from_slice(br#"{"code":200,"data":[{}]}"#).unwrap();
        assert_eq!(response.code, 200);
        assert!(response.message.is_none());
        assert!(response.data.is_array());
    }

    #[test]
    fn test_non_success_code_is_api_error() {
        let err = AllocationResponse::from_slice(br#"{"code":500,"message":"internal error"}"#)
            .unwrap_err();
        match err {
            ExportError::Api { code, message } => {
                assert_eq!(code, 500);
                assert_eq!(message, "internal error");
            }
            other => panic!("expected ApiError, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_and_garbage_bodies_are_transport_errors() {
        for body in [&b""[..], b"   \n", b"<html>bad gateway</html>", b"[1,2]", br#"{"data":[]}"#] {
            let err = AllocationResponse::from_slice(body).unwrap_err();
            assert!(
                matches!(err, ExportError::Transport(_)),
                "body {:?} gave {:?}",
                String::from_utf8_lossy(body),
                err
            );
        }
    }

    #[test]
    fn test_missing_data_decodes_as_null() {
        let response = AllocationResponse::from_slice(br#"{"code":200}"#).unwrap();
        assert!(response.data.is_null());
    }
}
