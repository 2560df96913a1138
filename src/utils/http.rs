use futures_util::StreamExt;

use crate::{ImagegenError, Result};

pub(crate) const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;
pub(crate) const MAX_RESPONSE_BODY_BYTES: usize = 32 * 1024 * 1024;

pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let (bytes, truncated) = match response_bytes_truncated(response, max_bytes).await {
        Ok(read) => read,
        Err(err) => return format!("<failed to read body: {err}>"),
    };
    let mut body = String::from_utf8_lossy(&bytes).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

/// Reads the whole body as text, refusing bodies over [`MAX_RESPONSE_BODY_BYTES`].
///
/// Transport errors mid-body surface as [`ImagegenError::Http`] so callers can treat them as
/// network failures.
pub(crate) async fn response_text_bounded(response: reqwest::Response) -> Result<String> {
    let bytes = response_bytes_bounded(response, MAX_RESPONSE_BODY_BYTES).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads at most `max_bytes`; a longer body is an [`ImagegenError::InvalidResponse`].
pub(crate) async fn response_bytes_bounded(
    response: reqwest::Response,
    max_bytes: usize,
) -> Result<Vec<u8>> {
    let (bytes, truncated) = response_bytes_truncated(response, max_bytes).await?;
    if truncated {
        return Err(ImagegenError::InvalidResponse(format!(
            "response exceeded max bytes ({max_bytes})"
        )));
    }
    Ok(bytes)
}

async fn response_bytes_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> Result<(Vec<u8>, bool)> {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let chunk = next?;
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }
    Ok((out, truncated))
}
