//! Framed JSON wire protocol.
//!
//! Every message is a 4-byte little-endian signed length prefix followed by
//! exactly that many bytes of a single JSON value. Requests carry at least
//! `{"identifier": <string>}`, responses at least
//! `{"version": <int>, "identifier": <string>}`.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ServerError;
use crate::provider::AnisetteData;

/// Schema version of success responses.
pub const RESPONSE_VERSION: i64 = 1;
/// Schema version of error responses.
pub const ERROR_RESPONSE_VERSION: i64 = 2;

/// First request of the install workflow; a raw package payload of
/// `content_size` bytes follows on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct PrepareAppRequest {
    pub udid: String,
    #[serde(rename = "contentSize")]
    pub content_size: u64,
}

/// Second request of the install workflow, sent after the package payload.
#[derive(Debug, Clone, Deserialize)]
pub struct BeginInstallationRequest {
    pub udid: String,
    #[serde(rename = "activeProfiles")]
    pub active_profiles: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallProvisioningProfilesRequest {
    pub udid: String,
    #[serde(rename = "provisioningProfiles")]
    pub provisioning_profiles: Vec<String>,
    #[serde(rename = "activeProfiles")]
    pub active_profiles: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveProvisioningProfilesRequest {
    pub udid: String,
    #[serde(rename = "bundleIdentifiers")]
    pub bundle_identifiers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveAppRequest {
    pub udid: String,
    #[serde(rename = "bundleIdentifier")]
    pub bundle_identifier: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnableUnsignedCodeExecutionRequest {
    pub udid: String,
    #[serde(rename = "processID")]
    pub process_id: Option<u64>,
    #[serde(rename = "processName")]
    pub process_name: Option<String>,
}

/// A parsed client request, tagged by its `identifier` field.
#[derive(Debug, Clone)]
pub enum Request {
    PrepareApp(PrepareAppRequest),
    BeginInstallation(BeginInstallationRequest),
    AnisetteData,
    InstallProvisioningProfiles(InstallProvisioningProfilesRequest),
    RemoveProvisioningProfiles(RemoveProvisioningProfilesRequest),
    RemoveApp(RemoveAppRequest),
    EnableUnsignedCodeExecution(EnableUnsignedCodeExecutionRequest),
}

impl Request {
    /// Parses one JSON value into a request. Unrecognized identifiers are
    /// `UnknownRequest`; a missing identifier or bad payload is
    /// `InvalidRequest`.
    pub fn from_value(value: Value) -> Result<Self, ServerError> {
        let identifier = value
            .get("identifier")
            .and_then(|v| v.as_str())
            .ok_or(ServerError::InvalidRequest)?
            .to_owned();

        match identifier.as_str() {
            "PrepareAppRequest" => Ok(Request::PrepareApp(serde_json::from_value(value)?)),
            "BeginInstallationRequest" => {
                Ok(Request::BeginInstallation(serde_json::from_value(value)?))
            }
            "AnisetteDataRequest" => Ok(Request::AnisetteData),
            "InstallProvisioningProfilesRequest" => Ok(Request::InstallProvisioningProfiles(
                serde_json::from_value(value)?,
            )),
            "RemoveProvisioningProfilesRequest" => Ok(Request::RemoveProvisioningProfiles(
                serde_json::from_value(value)?,
            )),
            "RemoveAppRequest" => Ok(Request::RemoveApp(serde_json::from_value(value)?)),
            "EnableUnsignedCodeExecutionRequest" => Ok(Request::EnableUnsignedCodeExecution(
                serde_json::from_value(value)?,
            )),
            _ => Err(ServerError::UnknownRequest),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ServerError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }
}

pub fn installation_progress_response(progress: f64) -> Value {
    json!({
        "version": RESPONSE_VERSION,
        "identifier": "InstallationProgressResponse",
        "progress": progress,
    })
}

pub fn anisette_data_response(data: &AnisetteData) -> Result<Value, ServerError> {
    let payload = serde_json::to_value(data).map_err(|_| ServerError::InvalidResponse)?;
    Ok(json!({
        "version": RESPONSE_VERSION,
        "identifier": "AnisetteDataResponse",
        "anisetteData": payload,
    }))
}

pub fn install_provisioning_profiles_response() -> Value {
    json!({
        "version": RESPONSE_VERSION,
        "identifier": "InstallProvisioningProfilesResponse",
    })
}

pub fn remove_provisioning_profiles_response() -> Value {
    json!({
        "version": RESPONSE_VERSION,
        "identifier": "RemoveProvisioningProfilesResponse",
    })
}

pub fn remove_app_response() -> Value {
    json!({
        "version": RESPONSE_VERSION,
        "identifier": "RemoveAppResponse",
    })
}

pub fn enable_unsigned_code_execution_response() -> Value {
    json!({
        "version": RESPONSE_VERSION,
        "identifier": "EnableUnsignedCodeExecutionResponse",
    })
}

/// Builds the version-2 error response: a top-level error code plus a nested
/// error object with the same code and the user-info map.
pub fn error_response(error: &ServerError) -> Value {
    let payload = error.payload();
    json!({
        "version": ERROR_RESPONSE_VERSION,
        "identifier": "ErrorResponse",
        "errorCode": payload.code,
        "serverError": {
            "errorCode": payload.code,
            "userInfo": payload.user_info,
        },
    })
}

/// Serializes a response and prepends its little-endian length prefix.
pub fn encode_frame(value: &Value) -> Result<Vec<u8>, ServerError> {
    let body = serde_json::to_vec(value).map_err(|_| ServerError::InvalidResponse)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as i32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remove_app_request() {
        let request = Request::from_slice(
            br#"{"identifier":"RemoveAppRequest","udid":"ABCD","bundleIdentifier":"com.example.app"}"#,
        )
        .unwrap();
        match request {
            Request::RemoveApp(r) => {
                assert_eq!(r.udid, "ABCD");
                assert_eq!(r.bundle_identifier, "com.example.app");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_identifier_is_unknown_request() {
        let result = Request::from_slice(br#"{"identifier":"SelfDestructRequest"}"#);
        assert!(matches!(result, Err(ServerError::UnknownRequest)));
    }

    #[test]
    fn missing_identifier_is_invalid_request() {
        let result = Request::from_slice(br#"{"udid":"ABCD"}"#);
        assert!(matches!(result, Err(ServerError::InvalidRequest)));
    }

    #[test]
    fn error_response_shape() {
        let response = error_response(&ServerError::UnknownRequest);
        assert_eq!(response["version"], 2);
        assert_eq!(response["identifier"], "ErrorResponse");
        assert_eq!(response["errorCode"], 11);
        assert_eq!(response["serverError"]["errorCode"], 11);
    }

    #[test]
    fn frames_are_length_prefixed_little_endian() {
        let frame = encode_frame(&remove_app_response()).unwrap();
        let len = i32::from_le_bytes(frame[..4].try_into().unwrap());
        assert_eq!(len as usize, frame.len() - 4);
        let value: Value = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(value["identifier"], "RemoveAppResponse");
    }
}
