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

//! Service identification for TCP streams: maps `(dst_port, src_port,
//! leading bytes)` to the upper-layer processing function. Consulted after
//! every append to the identification buffer until it resolves or the
//! buffer fills.

use super::{Processor, Service};
use crate::parsers::{dns, ftp, http, imap, pop3, smtp, tls};

const HTTP_PORTS: [u16; 4] = [80, 8080, 8000, 3128];
const SMTP_PORTS: [u16; 2] = [25, 587];
const POP3_PORT: u16 = 110;
const IMAP_PORT: u16 = 143;
const FTP_PORT: u16 = 21;
const DNS_PORT: u16 = 53;

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"HEAD ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"TRACE ",
    b"CONNECT ",
];

fn starts_with(buf: &[u8], prefix: &[u8]) -> bool {
    buf.len() >= prefix.len() && &buf[..prefix.len()] == prefix
}

fn is_tls_client_hello(buf: &[u8]) -> bool {
    // handshake record, SSL3.0..TLS1.3 on the wire
    buf.len() >= 3 && buf[0] == 0x16 && buf[1] == 0x03 && buf[2] <= 0x04
}

fn is_http_request(buf: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|m| starts_with(buf, m))
}

fn plain(processor: Processor) -> Option<Service> {
    Some(Service {
        processor,
        on_close: None,
    })
}

/// Resolves the service for a stream, or `None` while the leading bytes are
/// still inconclusive. Content patterns outrank port hints so TLS on an
/// unusual port is still spotted.
pub fn identify(src_port: u16, dst_port: u16, buf: &[u8]) -> Option<Service> {
    if is_tls_client_hello(buf) {
        return plain(tls::process);
    }
    if src_port == DNS_PORT || dst_port == DNS_PORT {
        return plain(dns::process_stream);
    }
    if HTTP_PORTS.contains(&dst_port) && is_http_request(buf) {
        return plain(http::process_request);
    }
    if HTTP_PORTS.contains(&src_port) && starts_with(buf, b"HTTP/") {
        // streaming response bodies end with the connection
        return Some(Service {
            processor: http::process_response,
            on_close: Some(http::on_close_response),
        });
    }
    if SMTP_PORTS.contains(&dst_port) && !buf.is_empty() {
        return plain(smtp::process_client);
    }
    if SMTP_PORTS.contains(&src_port) && starts_with(buf, b"220") {
        return plain(smtp::process_server);
    }
    if dst_port == POP3_PORT && !buf.is_empty() {
        return plain(pop3::process_client);
    }
    if src_port == POP3_PORT && starts_with(buf, b"+OK") {
        return plain(pop3::process_server);
    }
    if dst_port == IMAP_PORT && !buf.is_empty() {
        return plain(imap::process_client);
    }
    if src_port == IMAP_PORT && starts_with(buf, b"* OK") {
        return plain(imap::process_server);
    }
    if dst_port == FTP_PORT && !buf.is_empty() {
        return plain(ftp::process_client);
    }
    if src_port == FTP_PORT && starts_with(buf, b"220") {
        return plain(ftp::process_server);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_by_port_and_method() {
        assert!(identify(1234, 80, b"GET / HTTP/1.1\r\n").is_some());
        assert!(identify(80, 1234, b"HTTP/1.1 200 OK\r\n").is_some());
        // right port, wrong leading bytes: stays unresolved
        assert!(identify(1234, 80, b"\x00\x01\x02\x03").is_none());
    }

    #[test]
    fn tls_by_content_on_any_port() {
        let hello = [0x16u8, 0x03, 0x01, 0x00, 0x2f, 0x01];
        assert!(identify(1234, 443, &hello).is_some());
        assert!(identify(1234, 9999, &hello).is_some());
    }

    #[test]
    fn mail_banners() {
        assert!(identify(25, 1234, b"220 mail.example.com ESMTP").is_some());
        assert!(identify(110, 1234, b"+OK ready").is_some());
        assert!(identify(143, 1234, b"* OK IMAP4rev1").is_some());
        assert!(identify(21, 1234, b"220 ftp").is_some());
        assert!(identify(9999, 1234, b"220 something").is_none());
    }

    #[test]
    fn dns_by_port_alone() {
        assert!(identify(1234, 53, b"\x00").is_some());
        assert!(identify(53, 1234, b"\x00").is_some());
    }
}
