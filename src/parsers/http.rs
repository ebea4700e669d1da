/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! HTTP/1.x parsing. The request and response structures are almost
//! identical, so one resumable state machine serves both roles; a context
//! per direction carries it across slices. Transactions complete on body
//! end and the machine resets for the next one on the same flow
//! (keep-alive).

use std::sync::Arc;

use log::debug;

use crate::common::address::FlowAddress;
use crate::common::pdu::PduSlice;
use crate::config::AnalyzerConfig;
use crate::context::{Context, ContextState};
use crate::engine::Manager;
use crate::error::{Error, Result};
use crate::event::{EventData, EventType, Headers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    // request start line
    InRequestMethod,
    InRequestUrl,
    InRequestProtocol,
    PostRequestProtocolExpNl,

    // response start line
    InResponseProtocol,
    InResponseCode,
    InResponseStatus,
    PostResponseStatusExpNl,

    // headers
    MaybeKey,
    InKey,
    PostKeyExpSpace,
    InValue,
    InContinuation,
    PostValueExpNl,
    PostHeaderExpNl,

    // body, counting bytes
    CountingData,

    // body, chunked transfer encoding
    PreChunkLength,
    InChunkLength,
    PostChunkLengthExpNl,
    CountingChunkData,
    PostChunkDataExpCr,
    PostChunkDataExpNl,
    FinalChunkExpCr,
    FinalChunkExpNl,

    // response with neither length nor chunking
    Streaming,
}

/// Resumable parser state for one direction of an HTTP flow.
pub struct HttpState {
    variant: Variant,
    state: State,

    protocol: String,
    method: String,
    url: String,
    code: String,
    status: String,

    header: Headers,
    key: String,
    value: String,
    last_key: String,

    chunk_length: String,
    content_remaining: u64,
    body: Vec<u8>,

    streaming: bool,
    urls_requested: Vec<String>,
}

type Completed = (EventType, EventData);

impl HttpState {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            state: match variant {
                Variant::Request => State::InRequestMethod,
                Variant::Response => State::InResponseProtocol,
            },
            protocol: String::new(),
            method: String::new(),
            url: String::new(),
            code: String::new(),
            status: String::new(),
            header: Headers::default(),
            key: String::new(),
            value: String::new(),
            last_key: String::new(),
            chunk_length: String::new(),
            content_remaining: 0,
            body: Vec::new(),
            streaming: false,
            urls_requested: Vec::new(),
        }
    }

    pub fn urls_requested(&self) -> &[String] {
        &self.urls_requested
    }

    fn reset_transaction(&mut self) {
        self.protocol.clear();
        self.method.clear();
        self.url.clear();
        self.code.clear();
        self.status.clear();
        self.header = Headers::default();
        self.key.clear();
        self.value.clear();
        self.last_key.clear();
        self.chunk_length.clear();
        self.content_remaining = 0;
        self.body.clear();
        self.state = match self.variant {
            Variant::Request => State::InRequestMethod,
            Variant::Response => State::InResponseProtocol,
        };
    }

    fn complete_request(&mut self, out: &mut Vec<Completed>) {
        let host = self.header.get("host").unwrap_or("").to_string();
        let url = normalise_url(&host, &self.url);
        self.urls_requested.push(url.clone());
        out.push((
            EventType::HttpRequest,
            EventData::HttpRequest {
                method: std::mem::take(&mut self.method),
                url,
                protocol: std::mem::take(&mut self.protocol),
                headers: std::mem::take(&mut self.header),
                body: std::mem::take(&mut self.body),
            },
        ));
        self.reset_transaction();
    }

    fn complete_response(&mut self, out: &mut Vec<Completed>) {
        out.push((
            EventType::HttpResponse,
            EventData::HttpResponse {
                code: self.code.parse().unwrap_or(0),
                status: std::mem::take(&mut self.status),
                protocol: std::mem::take(&mut self.protocol),
                headers: std::mem::take(&mut self.header),
                body: std::mem::take(&mut self.body),
            },
        ));
        self.reset_transaction();
    }

    fn complete(&mut self, out: &mut Vec<Completed>) {
        match self.variant {
            Variant::Request => self.complete_request(out),
            Variant::Response => self.complete_response(out),
        }
    }

    fn commit_header(&mut self) {
        let key = std::mem::take(&mut self.key);
        let value = std::mem::take(&mut self.value);
        self.last_key = key.clone();
        self.header.insert(key, value.trim_end().to_string());
    }

    /// Chooses the body mode once the blank line after the headers is seen.
    fn on_headers_end(&mut self, out: &mut Vec<Completed>) {
        let chunked = self
            .header
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        if chunked {
            self.chunk_length.clear();
            self.state = State::PreChunkLength;
            return;
        }
        if let Some(cl) = self.header.get("content-length") {
            let n = cl.trim().parse::<u64>().unwrap_or(0);
            if n > 0 {
                self.content_remaining = n;
                self.state = State::CountingData;
                return;
            }
            self.complete(out);
            return;
        }
        match self.variant {
            // requests without a body end at the blank line
            Variant::Request => self.complete(out),
            Variant::Response => {
                let code: u32 = self.code.parse().unwrap_or(0);
                if code < 200 || code == 204 || code == 304 {
                    self.complete(out);
                } else {
                    // neither length nor chunking: report the header now and
                    // stream the body without buffering it
                    self.streaming = true;
                    let ev = (
                        EventType::HttpResponse,
                        EventData::HttpResponse {
                            code,
                            status: self.status.clone(),
                            protocol: self.protocol.clone(),
                            headers: self.header.clone(),
                            body: Vec::new(),
                        },
                    );
                    out.push(ev);
                    self.state = State::Streaming;
                }
            }
        }
    }

    /// Advances the machine over one slice, collecting completed
    /// transactions. Deferred data lives in `self`; the slice is never
    /// retained.
    pub fn parse(&mut self, data: &[u8]) -> Result<Vec<Completed>> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < data.len() {
            // bulk states first, byte states below
            match self.state {
                State::CountingData | State::CountingChunkData => {
                    let take = (data.len() - i).min(self.content_remaining as usize);
                    self.body.extend_from_slice(&data[i..i + take]);
                    self.content_remaining -= take as u64;
                    i += take;
                    if self.content_remaining == 0 {
                        if self.state == State::CountingData {
                            self.complete(&mut out);
                        } else {
                            self.state = State::PostChunkDataExpCr;
                        }
                    }
                    continue;
                }
                State::Streaming => {
                    // body bytes accumulate until the connection closes
                    self.body.extend_from_slice(&data[i..]);
                    return Ok(out);
                }
                _ => {}
            }

            let c = data[i];
            i += 1;
            match self.state {
                State::InRequestMethod => match c {
                    b' ' => self.state = State::InRequestUrl,
                    _ => self.method.push(c as char),
                },
                State::InRequestUrl => match c {
                    b' ' => self.state = State::InRequestProtocol,
                    _ => self.url.push(c as char),
                },
                State::InRequestProtocol => match c {
                    b'\r' => self.state = State::PostRequestProtocolExpNl,
                    _ => self.protocol.push(c as char),
                },
                State::PostRequestProtocolExpNl => match c {
                    b'\n' => self.state = State::MaybeKey,
                    _ => return Err(Error::HttpParseFailed("expected LF after request line")),
                },
                State::InResponseProtocol => match c {
                    b' ' => self.state = State::InResponseCode,
                    _ => self.protocol.push(c as char),
                },
                State::InResponseCode => match c {
                    b' ' => self.state = State::InResponseStatus,
                    b'\r' => self.state = State::PostResponseStatusExpNl,
                    _ => self.code.push(c as char),
                },
                State::InResponseStatus => match c {
                    b'\r' => self.state = State::PostResponseStatusExpNl,
                    _ => self.status.push(c as char),
                },
                State::PostResponseStatusExpNl => match c {
                    b'\n' => self.state = State::MaybeKey,
                    _ => return Err(Error::HttpParseFailed("expected LF after status line")),
                },
                State::MaybeKey => match c {
                    b'\r' => self.state = State::PostHeaderExpNl,
                    b' ' | b'\t' => {
                        // folded continuation of the previous header value
                        self.value.clear();
                        self.state = State::InContinuation;
                    }
                    _ => {
                        self.key.clear();
                        self.key.push(c as char);
                        self.state = State::InKey;
                    }
                },
                State::InKey => match c {
                    b':' => self.state = State::PostKeyExpSpace,
                    b'\r' => return Err(Error::HttpParseFailed("header line without colon")),
                    _ => self.key.push(c as char),
                },
                State::PostKeyExpSpace => match c {
                    b' ' | b'\t' => {}
                    b'\r' => {
                        self.value.clear();
                        self.commit_header();
                        self.state = State::PostValueExpNl;
                    }
                    _ => {
                        self.value.clear();
                        self.value.push(c as char);
                        self.state = State::InValue;
                    }
                },
                State::InValue => match c {
                    b'\r' => {
                        self.commit_header();
                        self.state = State::PostValueExpNl;
                    }
                    _ => self.value.push(c as char),
                },
                State::InContinuation => match c {
                    b'\r' => {
                        let key = self.last_key.clone();
                        let extra = self.value.trim().to_string();
                        self.header.append(&key, &extra);
                        self.value.clear();
                        self.state = State::PostValueExpNl;
                    }
                    _ => self.value.push(c as char),
                },
                State::PostValueExpNl => match c {
                    b'\n' => self.state = State::MaybeKey,
                    _ => return Err(Error::HttpParseFailed("expected LF after header")),
                },
                State::PostHeaderExpNl => match c {
                    b'\n' => self.on_headers_end(&mut out),
                    _ => return Err(Error::HttpParseFailed("expected LF after headers")),
                },
                State::PreChunkLength => match c {
                    b'\r' => return Err(Error::HttpParseFailed("empty chunk length")),
                    _ => {
                        self.chunk_length.clear();
                        self.chunk_length.push(c as char);
                        self.state = State::InChunkLength;
                    }
                },
                State::InChunkLength => match c {
                    b'\r' => {
                        let n = u64::from_str_radix(self.chunk_length.trim(), 16)
                            .map_err(|_| Error::HttpParseFailed("bad chunk length"))?;
                        self.content_remaining = n;
                        self.state = State::PostChunkLengthExpNl;
                    }
                    _ => self.chunk_length.push(c as char),
                },
                State::PostChunkLengthExpNl => match c {
                    b'\n' => {
                        if self.content_remaining == 0 {
                            self.state = State::FinalChunkExpCr;
                        } else {
                            self.state = State::CountingChunkData;
                        }
                    }
                    _ => return Err(Error::HttpParseFailed("expected LF after chunk length")),
                },
                State::PostChunkDataExpCr => match c {
                    b'\r' => self.state = State::PostChunkDataExpNl,
                    _ => return Err(Error::HttpParseFailed("expected CR after chunk data")),
                },
                State::PostChunkDataExpNl => match c {
                    b'\n' => self.state = State::PreChunkLength,
                    _ => return Err(Error::HttpParseFailed("expected LF after chunk data")),
                },
                State::FinalChunkExpCr => match c {
                    b'\r' => self.state = State::FinalChunkExpNl,
                    _ => return Err(Error::HttpParseFailed("expected CR after last chunk")),
                },
                State::FinalChunkExpNl => match c {
                    b'\n' => self.complete(&mut out),
                    _ => return Err(Error::HttpParseFailed("expected LF after last chunk")),
                },
                State::CountingData | State::CountingChunkData | State::Streaming => {
                    unreachable!("bulk states are consumed above")
                }
            }
        }
        Ok(out)
    }

    /// Ends a streaming transaction when the transport closes, yielding the
    /// response carrying everything accumulated since the header was
    /// announced. Any other state has nothing that a close delimits.
    pub fn on_close(&mut self) -> Option<Completed> {
        if self.state != State::Streaming {
            return None;
        }
        let mut out = Vec::new();
        self.complete(&mut out);
        out.pop()
    }
}

/// Request targets already carrying a scheme stay verbatim; relative ones
/// get `http://` plus the Host header prefixed.
pub fn normalise_url(host: &str, url: &str) -> String {
    let mut chars = url.chars();
    let mut seen_alpha = false;
    loop {
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => seen_alpha = true,
            Some(':') if seen_alpha => return url.to_string(),
            _ => break,
        }
    }
    format!("http://{}{}", host, url)
}

fn run(
    mgr: &dyn Manager,
    ctx: &Arc<Context>,
    slice: &PduSlice,
    variant: Variant,
) -> Result<()> {
    let completed = ctx.with_state(|s| match (variant, s) {
        (Variant::Request, ContextState::HttpRequest(h)) => h.parse(slice.data),
        (Variant::Response, ContextState::HttpResponse(h)) => h.parse(slice.data),
        _ => Err(Error::ContextStateMismatch),
    })?;
    for (action, data) in completed {
        debug!("http transaction complete: {}", action.as_str());
        mgr.handle(ctx.event(action, slice.time, slice.direction, data));
    }
    Ok(())
}

/// HTTP request processing function, resolved by `tcp_ports` for the
/// client-to-server direction.
pub fn process_request(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = Context::get_or_create(tcp_ctx, FlowAddress::application("http_request"), || {
        ContextState::HttpRequest(HttpState::new(Variant::Request))
    });
    ctx.touch(slice.time);
    run(mgr, &ctx, slice, Variant::Request)
}

/// HTTP response processing function for the server-to-client direction.
pub fn process_response(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    let ctx = Context::get_or_create(tcp_ctx, FlowAddress::application("http_response"), || {
        ContextState::HttpResponse(HttpState::new(Variant::Response))
    });
    ctx.touch(slice.time);
    run(mgr, &ctx, slice, Variant::Response)
}

/// Close notification for the response direction: a streaming body ends
/// with the connection, so the accumulated transaction is reported here.
pub fn on_close_response(
    mgr: &dyn Manager,
    _config: &AnalyzerConfig,
    tcp_ctx: &Arc<Context>,
    slice: &PduSlice,
) -> Result<()> {
    // a close on a flow that never carried a response has nothing to flush
    let Some(ctx) = tcp_ctx.get_child(&FlowAddress::application("http_response")) else {
        return Ok(());
    };
    let completed = ctx.with_state(|s| match s {
        ContextState::HttpResponse(h) => Ok(h.on_close()),
        _ => Err(Error::ContextStateMismatch),
    })?;
    if let Some((action, data)) = completed {
        debug!("http streaming response closed");
        mgr.handle(ctx.event(action, slice.time, slice.direction, data));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(variant: Variant, input: &[u8]) -> Vec<Completed> {
        let mut state = HttpState::new(variant);
        state.parse(input).unwrap()
    }

    #[test]
    fn request_url_normalisation() {
        let out = parse_all(
            Variant::Request,
            b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n",
        );
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            EventData::HttpRequest { method, url, .. } => {
                assert_eq!(method, "GET");
                assert_eq!(url, "http://example.com/path");
            }
            _ => panic!("wrong payload"),
        }

        let out = parse_all(Variant::Request, b"GET http://x/y HTTP/1.1\r\nHost: h\r\n\r\n");
        match &out[0].1 {
            EventData::HttpRequest { url, .. } => assert_eq!(url, "http://x/y"),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn keep_alive_transactions_independent() {
        let input = b"GET /a HTTP/1.1\r\nHost: one\r\n\r\nGET /b HTTP/1.1\r\nHost: two\r\n\r\n";
        let out = parse_all(Variant::Request, input);
        assert_eq!(out.len(), 2);
        let urls: Vec<_> = out
            .iter()
            .map(|(_, d)| match d {
                EventData::HttpRequest { url, headers, .. } => (url.clone(), headers.len()),
                _ => panic!("wrong payload"),
            })
            .collect();
        assert_eq!(urls[0], ("http://one/a".to_string(), 1));
        assert_eq!(urls[1], ("http://two/b".to_string(), 1));
    }

    #[test]
    fn counting_body_split_across_slices() {
        let mut state = HttpState::new(Variant::Response);
        let out = state
            .parse(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello")
            .unwrap();
        assert!(out.is_empty());
        let out = state.parse(b" world").unwrap();
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            EventData::HttpResponse { code, body, .. } => {
                assert_eq!(*code, 200);
                assert_eq!(body, b"hello world");
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn chunked_body() {
        let out = parse_all(
            Variant::Response,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            EventData::HttpResponse { body, .. } => assert_eq!(body, b"hello world"),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn chunked_reserialise_reparse_identical() {
        let original = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-Tag: abc\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let out = parse_all(Variant::Response, original);
        let (headers, body) = match &out[0].1 {
            EventData::HttpResponse { headers, body, .. } => (headers.clone(), body.clone()),
            _ => panic!("wrong payload"),
        };

        // re-serialize the same headers with the body as a single chunk
        let mut doc = Vec::new();
        doc.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
        for (k, v) in headers.iter() {
            doc.extend_from_slice(format!("{}: {}\r\n", k, v).as_bytes());
        }
        doc.extend_from_slice(b"\r\n");
        doc.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        doc.extend_from_slice(&body);
        doc.extend_from_slice(b"\r\n0\r\n\r\n");

        let out2 = parse_all(Variant::Response, &doc);
        match &out2[0].1 {
            EventData::HttpResponse {
                headers: h2,
                body: b2,
                ..
            } => {
                assert_eq!(h2, &headers);
                assert_eq!(b2, &body);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn streaming_response_accumulates_until_close() {
        let mut state = HttpState::new(Variant::Response);
        let out = state
            .parse(b"HTTP/1.1 200 OK\r\nServer: s\r\n\r\nstream-bytes")
            .unwrap();
        // the header is announced immediately, body still open
        assert_eq!(out.len(), 1);
        match &out[0].1 {
            EventData::HttpResponse { body, .. } => assert!(body.is_empty()),
            _ => panic!("wrong payload"),
        }
        // further body bytes accumulate without another event
        assert!(state.parse(b" and more").unwrap().is_empty());
        assert!(state.streaming);

        // the connection close delivers the whole body
        let (action, data) = state.on_close().unwrap();
        assert_eq!(action, EventType::HttpResponse);
        match data {
            EventData::HttpResponse { code, body, .. } => {
                assert_eq!(code, 200);
                assert_eq!(body, b"stream-bytes and more");
            }
            _ => panic!("wrong payload"),
        }
        // a second close has nothing left to report
        assert!(state.on_close().is_none());
    }

    #[test]
    fn close_without_streaming_flushes_nothing() {
        let mut state = HttpState::new(Variant::Response);
        state
            .parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        assert!(state.on_close().is_none());
    }

    #[test]
    fn header_continuation_folds() {
        let out = parse_all(
            Variant::Request,
            b"GET / HTTP/1.1\r\nHost: h\r\nX-Long: part1\r\n part2\r\n\r\n",
        );
        match &out[0].1 {
            EventData::HttpRequest { headers, .. } => {
                assert_eq!(headers.get("x-long"), Some("part1 part2"));
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn header_case_preserved_and_lookup_insensitive() {
        let out = parse_all(
            Variant::Request,
            b"GET / HTTP/1.1\r\nHost: h\r\nX-MiXeD: v\r\n\r\n",
        );
        match &out[0].1 {
            EventData::HttpRequest { headers, .. } => {
                assert_eq!(headers.get("x-mixed"), Some("v"));
                let originals: Vec<_> = headers.iter().map(|(k, _)| k.to_string()).collect();
                assert!(originals.contains(&"X-MiXeD".to_string()));
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn urls_requested_accumulate() {
        let mut state = HttpState::new(Variant::Request);
        state
            .parse(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        assert_eq!(
            state.urls_requested(),
            &["http://h/a".to_string(), "http://h/b".to_string()]
        );
    }
}
