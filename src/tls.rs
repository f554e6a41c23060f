/*
 * Copyright (C) 2023 Fastly, Inc.
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

use crate::config::Settings;
use crate::net::Conn;
use log::debug;
use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{
    HandshakeError, Ssl, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslOptions,
    SslVerifyMode,
};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::X509;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Set of enabled protocol versions, parsed from a `+`-separated list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocols(u32);

impl Protocols {
    pub const SSLV2: Protocols = Protocols(1 << 0);
    pub const SSLV3: Protocols = Protocols(1 << 1);
    pub const TLSV1: Protocols = Protocols(1 << 2);
    pub const TLSV1_1: Protocols = Protocols(1 << 3);
    pub const TLSV1_2: Protocols = Protocols(1 << 4);
    pub const ALL: Protocols = Protocols(0x1f);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Protocols) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parses a `+`-separated protocol list. Tokens are case-insensitive
    /// and may be surrounded by whitespace. An empty input enables all
    /// protocols. An unrecognized token is an error: failing is safer than
    /// continuing with more protocols enabled than requested.
    pub fn parse(s: &str) -> Result<Protocols, String> {
        if s.trim().is_empty() {
            return Ok(Self::ALL);
        }

        let mut value = Protocols(0);

        for token in s.split('+') {
            let token = token.trim();

            value = match token.to_ascii_lowercase().as_str() {
                "sslv2" => Protocols(value.0 | Self::SSLV2.0),
                "sslv3" => Protocols(value.0 | Self::SSLV3.0),
                "tlsv1" => Protocols(value.0 | Self::TLSV1.0),
                "tlsv1.1" => Protocols(value.0 | Self::TLSV1_1.0),
                "tlsv1.2" => Protocols(value.0 | Self::TLSV1_2.0),
                "all" => Protocols(value.0 | Self::ALL.0),
                _ => return Err(token.to_string()),
            };
        }

        Ok(value)
    }
}

#[derive(Debug)]
pub enum TlsError {
    InvalidProtocol(String),
    Ssl(ErrorStack),
    FileContent(PathBuf, io::Error),
    Handshake(String),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidProtocol(s) => write!(f, "invalid SSL protocol: {}", s),
            Self::Ssl(e) => write!(f, "SSL error: {}", e),
            Self::FileContent(fname, e) => {
                write!(f, "failed to read {:?}: {}", fname, e)
            }
            Self::Handshake(s) => write!(f, "handshake failed: {}", s),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<ErrorStack> for TlsError {
    fn from(e: ErrorStack) -> Self {
        Self::Ssl(e)
    }
}

fn read_file(fname: &PathBuf) -> Result<Vec<u8>, TlsError> {
    fs::read(fname).map_err(|e| TlsError::FileContent(fname.clone(), e))
}

/// Builds a server-mode SSL context from the endpoint settings.
pub fn create_context(settings: &Settings) -> Result<SslContext, TlsError> {
    let protocols =
        Protocols::parse(&settings.ssl_protocol).map_err(TlsError::InvalidProtocol)?;

    let mut builder = SslContextBuilder::new(SslMethod::tls())?;

    let mut options = SslOptions::empty();

    // protocol selection works by masking out everything not requested.
    // SSLv2 support no longer exists in the TLS library, so that token only
    // participates in parsing
    if !protocols.contains(Protocols::SSLV3) {
        options |= SslOptions::NO_SSLV3;
    }
    if !protocols.contains(Protocols::TLSV1) {
        options |= SslOptions::NO_TLSV1;
    }
    if !protocols.contains(Protocols::TLSV1_1) {
        options |= SslOptions::NO_TLSV1_1;
    }
    if !protocols.contains(Protocols::TLSV1_2) {
        options |= SslOptions::NO_TLSV1_2;
    }

    // cipher order: client (default) or server
    if settings.ssl_honor_cipher_order {
        options |= SslOptions::CIPHER_SERVER_PREFERENCE;
    }

    if settings.ssl_disable_compression {
        options |= SslOptions::NO_COMPRESSION;
    }

    builder.set_options(options);

    // list the ciphers the client is permitted to negotiate
    if let Some(ciphers) = &settings.ssl_cipher_suite {
        builder.set_cipher_list(ciphers)?;
    }

    // server key and certificate
    if let Some(cert_file) = &settings.ssl_certificate_file {
        builder.set_certificate_file(cert_file, SslFiletype::PEM)?;

        let key_file = settings
            .ssl_certificate_key_file
            .as_ref()
            .unwrap_or(cert_file);

        match &settings.ssl_password {
            Some(password) => {
                let data = read_file(key_file)?;
                let key = PKey::private_key_from_pem_passphrase(&data, password.as_bytes())?;
                builder.set_private_key(&key)?;
            }
            None => builder.set_private_key_file(key_file, SslFiletype::PEM)?,
        }

        builder.check_private_key()?;
    }

    if let Some(chain_file) = &settings.ssl_certificate_chain_file {
        let data = read_file(chain_file)?;

        for cert in X509::stack_from_pem(&data)? {
            builder.add_extra_chain_cert(cert)?;
        }
    }

    // client certificate support. the CA path form loads every certificate
    // file found in the directory
    if let Some(ca_file) = &settings.ssl_ca_certificate_file {
        builder.set_ca_file(ca_file)?;
    }

    if let Some(ca_path) = &settings.ssl_ca_certificate_path {
        for entry in
            fs::read_dir(ca_path).map_err(|e| TlsError::FileContent(ca_path.clone(), e))?
        {
            let entry = entry.map_err(|e| TlsError::FileContent(ca_path.clone(), e))?;

            if entry.path().is_file() {
                builder.set_ca_file(entry.path())?;
            }
        }
    }

    // revocation lists load into the verify store the same way; checking is
    // enabled for the whole chain
    let revocation_file = settings.ssl_ca_revocation_file.is_some();
    let revocation_path = settings.ssl_ca_revocation_path.is_some();

    if let Some(crl_file) = &settings.ssl_ca_revocation_file {
        builder.set_ca_file(crl_file)?;
    }

    if let Some(crl_path) = &settings.ssl_ca_revocation_path {
        for entry in
            fs::read_dir(crl_path).map_err(|e| TlsError::FileContent(crl_path.clone(), e))?
        {
            let entry = entry.map_err(|e| TlsError::FileContent(crl_path.clone(), e))?;

            if entry.path().is_file() {
                builder.set_ca_file(entry.path())?;
            }
        }
    }

    if revocation_file || revocation_path {
        builder
            .verify_param_mut()
            .set_flags(X509VerifyFlags::CRL_CHECK | X509VerifyFlags::CRL_CHECK_ALL)?;
    }

    // client certificate verification
    let verify_client = settings.ssl_verify_client.as_str();

    if verify_client.eq_ignore_ascii_case("optional") {
        builder.set_verify(SslVerifyMode::PEER);
    } else if verify_client.eq_ignore_ascii_case("require") {
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    } else if verify_client.eq_ignore_ascii_case("optionalNoCA") {
        // accept a certificate even if its chain can't be verified
        builder.set_verify_callback(SslVerifyMode::PEER, |_preverified, _ctx| true);
    } else {
        builder.set_verify(SslVerifyMode::NONE);
    }

    builder.set_verify_depth(settings.ssl_verify_depth);

    Ok(builder.build())
}

/// Runs a server-side handshake on a plain connection, replacing its stream
/// with the TLS stream on success. The socket is expected to be in blocking
/// mode; a configured socket timeout bounds the handshake.
pub fn handshake(ctx: &SslContext, conn: &mut Conn) -> Result<(), TlsError> {
    let stream = match conn.take_plain() {
        Some(stream) => stream,
        None => {
            return Err(TlsError::Handshake(
                "connection is not a plain socket".to_string(),
            ))
        }
    };

    let ssl = Ssl::new(ctx)?;

    match ssl.accept(stream) {
        Ok(stream) => {
            debug!("conn {}: tls handshake success", conn.peer_addr());
            conn.set_tls(stream);

            Ok(())
        }
        Err(HandshakeError::SetupFailure(e)) => Err(TlsError::Ssl(e)),
        Err(HandshakeError::Failure(stream)) => {
            Err(TlsError::Handshake(stream.error().to_string()))
        }
        Err(HandshakeError::WouldBlock(_)) => {
            // the socket timeout expired mid-handshake
            Err(TlsError::Handshake("timed out".to_string()))
        }
    }
}
