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

use std::collections::BTreeMap;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::common::enums::Direction;

/// The closed set of semantic observations the analyzer can report.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ConnectionUp,
    ConnectionDown,
    TriggerUp,
    TriggerDown,
    UnrecognisedStream,
    UnrecognisedDatagram,
    UnrecognisedIpProtocol,
    Icmp,
    Imap,
    Pop3,
    Rtp,
    SipRequest,
    SipResponse,
    SmtpAuth,
    SmtpCommand,
    SmtpResponse,
    SmtpData,
    HttpRequest,
    HttpResponse,
    FtpCommand,
    FtpResponse,
    DnsMessage,
    NtpTimestampMessage,
    NtpControlMessage,
    NtpPrivateMessage,
    GreMessage,
    GrePptpMessage,
    Esp,
    TlsClientHello,
    TlsServerHello,
    TlsCertificates,
    TlsServerKeyExchange,
    TlsServerHelloDone,
    TlsCertificateRequest,
    TlsClientKeyExchange,
    TlsCertificateVerify,
    TlsChangeCipherSpec,
    TlsHandshakeFinished,
    TlsHandshakeComplete,
    TlsHandshakeGeneric,
    TlsApplicationData,
    TlsUnknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ConnectionUp => "connection_up",
            EventType::ConnectionDown => "connection_down",
            EventType::TriggerUp => "trigger_up",
            EventType::TriggerDown => "trigger_down",
            EventType::UnrecognisedStream => "unrecognised_stream",
            EventType::UnrecognisedDatagram => "unrecognised_datagram",
            EventType::UnrecognisedIpProtocol => "unrecognised_ip_protocol",
            EventType::Icmp => "icmp",
            EventType::Imap => "imap",
            EventType::Pop3 => "pop3",
            EventType::Rtp => "rtp",
            EventType::SipRequest => "sip_request",
            EventType::SipResponse => "sip_response",
            EventType::SmtpAuth => "smtp_auth",
            EventType::SmtpCommand => "smtp_command",
            EventType::SmtpResponse => "smtp_response",
            EventType::SmtpData => "smtp_data",
            EventType::HttpRequest => "http_request",
            EventType::HttpResponse => "http_response",
            EventType::FtpCommand => "ftp_command",
            EventType::FtpResponse => "ftp_response",
            EventType::DnsMessage => "dns_message",
            EventType::NtpTimestampMessage => "ntp_timestamp_message",
            EventType::NtpControlMessage => "ntp_control_message",
            EventType::NtpPrivateMessage => "ntp_private_message",
            EventType::GreMessage => "gre_message",
            EventType::GrePptpMessage => "gre_pptp_message",
            EventType::Esp => "esp",
            EventType::TlsClientHello => "tls_client_hello",
            EventType::TlsServerHello => "tls_server_hello",
            EventType::TlsCertificates => "tls_certificates",
            EventType::TlsServerKeyExchange => "tls_server_key_exchange",
            EventType::TlsServerHelloDone => "tls_server_hello_done",
            EventType::TlsCertificateRequest => "tls_certificate_request",
            EventType::TlsClientKeyExchange => "tls_client_key_exchange",
            EventType::TlsCertificateVerify => "tls_certificate_verify",
            EventType::TlsChangeCipherSpec => "tls_change_cipher_spec",
            EventType::TlsHandshakeFinished => "tls_handshake_finished",
            EventType::TlsHandshakeComplete => "tls_handshake_complete",
            EventType::TlsHandshakeGeneric => "tls_handshake_generic",
            EventType::TlsApplicationData => "tls_application_data",
            EventType::TlsUnknown => "tls_unknown",
        }
    }
}

/// HTTP-style header collection: case-insensitive lookup, original case
/// preserved for rendering. Keys are stored lowercased mapping to
/// `(original key, value)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(pub BTreeMap<String, (String, String)>);

impl Headers {
    pub fn insert(&mut self, key: String, value: String) {
        self.0.insert(key.to_ascii_lowercase(), (key, value));
    }

    /// Appends to an existing value, for folded continuation lines.
    pub fn append(&mut self, key: &str, extra: &str) {
        if let Some((_, v)) = self.0.get_mut(&key.to_ascii_lowercase()) {
            v.push(' ');
            v.push_str(extra);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.values().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (original, value) in self.0.values() {
            map.serialize_entry(original, value)?;
        }
        map.end()
    }
}

fn ser_bytes<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    serializer.serialize_str(&out)
}

fn ser_time<S: Serializer>(time: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(time.as_secs_f64())
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    /// Decoded representation for known record types, hex otherwise.
    pub rdata: String,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,
}

/// Protocol-specific payload of an event.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum EventData {
    Empty {},
    Trigger {
        address: String,
    },
    Payload {
        #[serde(serialize_with = "ser_bytes")]
        payload: Vec<u8>,
    },
    Icmp {
        icmp_type: u8,
        icmp_code: u8,
        #[serde(serialize_with = "ser_bytes")]
        payload: Vec<u8>,
    },
    UnrecognisedIpProtocol {
        protocol: u8,
        payload_length: u32,
    },
    HttpRequest {
        method: String,
        url: String,
        protocol: String,
        headers: Headers,
        #[serde(serialize_with = "ser_bytes")]
        body: Vec<u8>,
    },
    HttpResponse {
        code: u32,
        status: String,
        protocol: String,
        headers: Headers,
        #[serde(serialize_with = "ser_bytes")]
        body: Vec<u8>,
    },
    SmtpCommand {
        command: String,
    },
    SmtpResponse {
        status: u32,
        text: Vec<String>,
    },
    SmtpAuth {
        mechanism: String,
        initial: Option<String>,
    },
    SmtpData {
        from: String,
        to: Vec<String>,
        #[serde(serialize_with = "ser_bytes")]
        body: Vec<u8>,
    },
    FtpCommand {
        command: String,
    },
    FtpResponse {
        status: u32,
        text: Vec<String>,
    },
    SipRequest {
        method: String,
        uri: String,
        from: String,
        to: String,
    },
    SipResponse {
        code: u32,
        status: String,
        from: String,
        to: String,
    },
    Dns {
        header: DnsHeader,
        queries: Vec<DnsQuery>,
        answers: Vec<DnsAnswer>,
        authorities: Vec<DnsAnswer>,
        additional: Vec<DnsAnswer>,
    },
    NtpTimestamp {
        version: u8,
        mode: u8,
        stratum: u8,
        poll: i8,
        precision: i8,
    },
    NtpControl {
        version: u8,
    },
    NtpPrivate {
        version: u8,
    },
    Gre {
        next_proto: u16,
        key: Option<u32>,
        sequence_no: Option<u32>,
        #[serde(serialize_with = "ser_bytes")]
        payload: Vec<u8>,
    },
    GrePptp {
        call_id: u16,
        payload_length: u16,
        sequence_no: Option<u32>,
        ack_no: Option<u32>,
    },
    Esp {
        spi: u32,
        sequence: u32,
        payload_length: u32,
    },
    TlsClientHello {
        version: String,
        session_id: String,
        cipher_suites: Vec<u16>,
        server_name: Option<String>,
    },
    TlsServerHello {
        version: String,
        session_id: String,
        cipher_suite: u16,
    },
    TlsCertificates {
        /// DER certificate chain, outermost first.
        certs: Vec<Vec<u8>>,
    },
    TlsHandshake {
        handshake_type: u8,
        length: u32,
    },
    TlsApplicationData {
        length: u32,
    },
    Rtp {
        payload_type: u8,
        sequence: u16,
        timestamp: u32,
        ssrc: u32,
    },
}

/// A semantic observation handed to the [`crate::engine::Manager`] sink.
/// `id` is stamped by the engine as events pass through it.
#[derive(Serialize, Debug, Clone)]
pub struct Event {
    pub id: String,
    pub action: EventType,
    #[serde(serialize_with = "ser_time")]
    pub time: Duration,
    pub device: String,
    pub network: String,
    pub direction: Direction,
    pub src: String,
    pub dst: String,
    #[serde(flatten)]
    pub data: EventData,
}

impl Event {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
