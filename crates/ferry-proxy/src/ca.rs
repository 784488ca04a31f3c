//! Certificate authority for the proxy engine.
//!
//! The engine requires an authority even though `CONNECT` tunnels are never
//! intercepted, so a throwaway root is generated in memory at every start.

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

use crate::error::{ProxyError, Result};

const CA_COMMON_NAME: &str = "Ferry Ephemeral CA";

/// Generates an in-memory root and wraps it in a hudsucker authority.
pub fn ephemeral_authority() -> Result<RcgenAuthority> {
    let key_pair = KeyPair::generate().map_err(|e| ProxyError::Ca(e.to_string()))?;

    let mut params = CertificateParams::new(vec![CA_COMMON_NAME.to_string()])
        .map_err(|e| ProxyError::Ca(e.to_string()))?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::Ca(e.to_string()))?;

    let issuer = Issuer::from_ca_cert_pem(&cert.pem(), key_pair)
        .map_err(|e| ProxyError::Ca(e.to_string()))?;

    tracing::debug!("Generated ephemeral CA");
    Ok(RcgenAuthority::new(issuer, 100, default_provider()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_is_generated() {
        assert!(ephemeral_authority().is_ok());
    }
}
