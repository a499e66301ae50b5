use compass_runtime_agent_core::DirectorError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a, V> {
    pub query: &'a str,
    pub variables: V,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Response<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<Error>,
}

#[derive(Debug, Deserialize)]
struct Error {
    message: String,
}

/// Decodes a GraphQL response body. Any reported error fails the whole
/// response, even when partial data is present.
pub(crate) fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, DirectorError> {
    let Response { data, errors } = serde_json::from_slice::<Response<T>>(body)
        .map_err(|e| DirectorError::Parse(e.to_string()))?;

    if !errors.is_empty() {
        return Err(DirectorError::GraphQl(
            errors.into_iter().map(|e| e.message).collect(),
        ));
    }
    data.ok_or_else(|| DirectorError::Parse("response carries no data".to_string()))
}
