use chrono::{Datelike, Utc};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use rcgen::{
    date_time_ymd, CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, PKCS_ED25519,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::sync::Arc;
use x509_parser::oid_registry::OID_SIG_ED25519;

use crate::{TransportError, ALPN, SERVER_NAME};

const CERT_VALIDITY_YEARS: i32 = 10;

/// Self-signed certificate whose subject key is the device key.
///
/// The TLS handshake then proves possession of the device key and the
/// peer certificate is all a session needs to learn the remote identity.
pub struct TlsIdentity {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
    public_key: [u8; 32],
}

impl TlsIdentity {
    pub fn from_signing_key(signing_key: &SigningKey) -> Result<Self, TransportError> {
        let der = signing_key
            .to_pkcs8_der()
            .map_err(|e| TransportError::Certificate(e.to_string()))?;
        let key = PrivatePkcs8KeyDer::from(der.as_bytes().to_vec());
        let key_pair =
            KeyPair::from_pkcs8_der_and_sign_algo(&key, &PKCS_ED25519).map_err(cert_err)?;

        let mut params = CertificateParams::new(vec![SERVER_NAME.to_string()]).map_err(cert_err)?;
        params.distinguished_name.push(DnType::CommonName, SERVER_NAME);
        // Day clamped so the same date exists in the expiry year.
        let today = Utc::now().date_naive();
        let (year, month, day) = (today.year(), today.month() as u8, today.day().min(28) as u8);
        params.not_before = date_time_ymd(year, month, day);
        params.not_after = date_time_ymd(year + CERT_VALIDITY_YEARS, month, day);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params.self_signed(&key_pair).map_err(cert_err)?;
        Ok(Self {
            cert: cert.der().clone(),
            key,
            public_key: signing_key.verifying_key().to_bytes(),
        })
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub(crate) fn server_config(&self) -> Result<rustls::ServerConfig, TransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(Arc::new(DeviceKeyVerifier { provider }))
            .with_single_cert(vec![self.cert.clone()], PrivateKeyDer::Pkcs8(self.key.clone_key()))?;
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(config)
    }

    pub(crate) fn client_config(&self) -> Result<rustls::ClientConfig, TransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeviceKeyVerifier { provider }))
            .with_client_auth_cert(vec![self.cert.clone()], PrivateKeyDer::Pkcs8(self.key.clone_key()))?;
        config.alpn_protocols = vec![ALPN.to_vec()];
        Ok(config)
    }
}

fn cert_err(e: rcgen::Error) -> TransportError {
    TransportError::Certificate(e.to_string())
}

/// Raw ed25519 public key from a DER certificate.
pub fn peer_public_key(cert: &[u8]) -> Result<[u8; 32], TransportError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert)
        .map_err(|e| TransportError::PeerKey(format!("unparseable certificate: {e}")))?;
    let spki = parsed.public_key();
    if spki.algorithm.algorithm != OID_SIG_ED25519 {
        return Err(TransportError::PeerKey("peer key is not ed25519".into()));
    }
    spki.subject_public_key
        .data
        .as_ref()
        .try_into()
        .map_err(|_| TransportError::PeerKey("ed25519 key has the wrong length".into()))
}

/// Accepts any certificate carrying an ed25519 key, in either direction.
///
/// There is no CA: who the peer is gets decided above TLS by fingerprint
/// pinning and the SAS. Handshake signatures are still checked, so the peer
/// must hold the private half of the key in its certificate.
#[derive(Debug)]
struct DeviceKeyVerifier {
    provider: Arc<CryptoProvider>,
}

impl DeviceKeyVerifier {
    fn check_leaf(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        peer_public_key(end_entity)
            .map(|_| ())
            .map_err(|e| match e {
                TransportError::PeerKey(msg) if msg.starts_with("unparseable") => {
                    rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
                }
                other => rustls::Error::General(other.to_string()),
            })
    }

    fn check_tls13(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        if dss.scheme != SignatureScheme::ED25519 {
            return Err(rustls::Error::General(format!(
                "unexpected signature scheme {:?}",
                dss.scheme
            )));
        }
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }
}

impl ServerCertVerifier for DeviceKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check_leaf(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 is not supported".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.check_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

impl ClientCertVerifier for DeviceKeyVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check_leaf(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 is not supported".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.check_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn certificate_carries_device_key() {
        let key = SigningKey::generate(&mut OsRng);
        let id = TlsIdentity::from_signing_key(&key).unwrap();
        let extracted = peer_public_key(id.certificate()).unwrap();
        assert_eq!(extracted, key.verifying_key().to_bytes());
        assert_eq!(id.public_key(), &extracted);
    }

    #[test]
    fn certificate_subject_and_usages() {
        let key = SigningKey::generate(&mut OsRng);
        let id = TlsIdentity::from_signing_key(&key).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(id.certificate()).unwrap();
        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), SERVER_NAME);
        let eku = cert.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth && eku.client_auth);
        let validity = cert.validity();
        let years = (validity.not_after.timestamp() - validity.not_before.timestamp()) / 86_400 / 365;
        assert!(years >= 9);
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        assert!(matches!(
            peer_public_key(b"not a certificate"),
            Err(TransportError::PeerKey(_))
        ));
    }

    #[test]
    fn non_ed25519_certificate_is_refused() {
        let ecdsa = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()]).unwrap();
        let der = ecdsa.cert.der();
        assert!(matches!(
            peer_public_key(der),
            Err(TransportError::PeerKey(msg)) if msg.contains("not ed25519")
        ));

        let verifier = DeviceKeyVerifier {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        };
        let name = ServerName::try_from(SERVER_NAME).unwrap();
        assert!(verifier
            .verify_server_cert(der, &[], &name, &[], UnixTime::now())
            .is_err());
        assert!(verifier.verify_client_cert(der, &[], UnixTime::now()).is_err());

        let key = SigningKey::generate(&mut OsRng);
        let id = TlsIdentity::from_signing_key(&key).unwrap();
        assert!(verifier
            .verify_server_cert(id.certificate(), &[], &name, &[], UnixTime::now())
            .is_ok());
    }

    #[test]
    fn configs_build_and_offer_alpn() {
        let key = SigningKey::generate(&mut OsRng);
        let id = TlsIdentity::from_signing_key(&key).unwrap();
        assert_eq!(id.server_config().unwrap().alpn_protocols, vec![ALPN.to_vec()]);
        assert_eq!(id.client_config().unwrap().alpn_protocols, vec![ALPN.to_vec()]);
    }
}
