//! HTTP adapter for the stream state machine.
//! Translates axum extractors into a `StreamRequest` and the resulting
//! `StreamResponse` into headers plus a streaming body.

use crate::{
    errors::AppError,
    services::stream_service::{StreamMethod, StreamRequest, StreamResponse, StreamService},
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures::stream;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::{collections::HashMap, io};

pub const WATERMARK_HEADER: HeaderName = HeaderName::from_static("x-watermark-text");
const VIDEO_MP4: &str = "video/mp4";

/// `GET|HEAD /stream/{asset_id}?token=...`
pub async fn stream_video(
    State(service): State<StreamService>,
    Path(asset_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let method = if method == Method::HEAD {
        StreamMethod::Head
    } else {
        StreamMethod::Get
    };
    let request = StreamRequest {
        method,
        asset_id,
        headers: header_map(&headers),
        query,
    };

    let outcome = service.handle(request).await?;
    Ok(into_response(outcome))
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn into_response(outcome: StreamResponse) -> Response {
    let StreamResponse {
        asset,
        label,
        content_length,
        content_range,
        body,
    } = outcome;

    // HEAD: a size-less empty body, so no `Content-Length: 0` is derived
    // from it when the real length is unknown.
    let body = match body {
        Some(body) => Body::from_stream(body.into_stream()),
        None => Body::from_stream(stream::empty::<io::Result<Bytes>>()),
    };

    let mut response = Response::new(body);
    *response.status_mut() = if content_range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(VIDEO_MP4));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&asset.title)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&label) {
        headers.insert(WATERMARK_HEADER, value);
    }
    if let Some(length) = content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    if let Some(range) = content_range {
        let value = format!(
            "bytes {}-{}/{}",
            range.range.start, range.range.end, range.total
        );
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }

    response
}

/// `inline` disposition with an ASCII `filename` and, for non-ASCII titles,
/// an RFC 5987 `filename*`.
fn content_disposition(title: &str) -> String {
    let title = title.trim();
    let fallback: String = title
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let fallback = if fallback.is_empty() {
        "video".to_string()
    } else {
        fallback
    };

    if title.is_ascii() {
        format!("inline; filename=\"{}.mp4\"", fallback)
    } else {
        let encoded = utf8_percent_encode(title, NON_ALPHANUMERIC);
        format!(
            "inline; filename=\"{}.mp4\"; filename*=UTF-8''{}.mp4",
            fallback, encoded
        )
    }
}
