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

pub mod dns;
pub mod ftp;
pub mod http;
pub mod imap;
pub mod ntp;
pub mod pop3;
pub mod rtp;
pub mod sip;
pub mod smtp;
pub mod tls;

/// Resumable CRLF line accumulator for the text protocols. Bytes go in as
/// they arrive; complete lines (terminators stripped) come out. Anything
/// after a partial line stays buffered in the parser's context.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_across_slices() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"EHLO exam").is_empty());
        let lines = buf.push(b"ple.com\r\nMAIL FROM:<a@b>\r\nRCP");
        assert_eq!(lines, vec!["EHLO example.com", "MAIL FROM:<a@b>"]);
        assert_eq!(buf.push(b"T TO:<c@d>\r\n"), vec!["RCPT TO:<c@d>"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn bare_newline_accepted() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push(b"one\ntwo\r\n"), vec!["one", "two"]);
    }
}
