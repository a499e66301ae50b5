//! Client certificate parsing, signing requests and the renewal threshold.

use crate::{ConnectorError, ErrorKind};
use chrono::{DateTime, Utc};
use rcgen::{
    string::PrintableString, CertificateParams, DistinguishedName, DnType, DnValue, KeyPair,
};
use std::{fmt, str::FromStr};
use x509_parser::prelude::*;

mod manager;

pub use self::manager::CertificateManager;

/// The validity window and subject of a client certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject: Subject,
}

/// An ordered list of distinguished-name attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subject(Vec<(SubjectField, String)>);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubjectField {
    Organization,
    OrganizationalUnit,
    Locality,
    Province,
    Country,
    CommonName,
}

/// A private key and a PKCS#10 signing request for it.
pub struct CertificateRequest {
    key_pem: String,
    csr_der: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("invalid certificate subject {0:?}")]
    InvalidSubject(String),

    #[error("failed to build certificate signing request: {0}")]
    Request(String),

    #[error("failed to parse certificate: {0}")]
    Parse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RenewalError {
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

/// Returns true once `threshold` of the certificate's lifetime has elapsed.
///
/// Certificates with an empty or inverted validity window are always renewed.
pub fn should_renew(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: f64,
) -> bool {
    let lifetime = (not_after - not_before).num_seconds();
    if lifetime <= 0 {
        return true;
    }
    let elapsed = (now - not_before).num_seconds();
    elapsed as f64 / lifetime as f64 >= threshold
}

/// Parses the first certificate of a PEM bundle.
pub fn parse_certificate(pem_data: &str) -> Result<CertificateInfo, CertificateError> {
    let block = ::pem::parse_many(pem_data.as_bytes())
        .map_err(|e| CertificateError::Parse(format!("invalid PEM: {e}")))?
        .into_iter()
        .find(|p| p.tag() == "CERTIFICATE")
        .ok_or_else(|| CertificateError::Parse("no certificate found".to_string()))?;

    let (_, cert) = X509Certificate::from_der(block.contents())
        .map_err(|e| CertificateError::Parse(e.to_string()))?;

    let validity = cert.validity();
    let timestamp = |secs: i64| {
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| CertificateError::Parse(format!("timestamp out of range: {secs}")))
    };

    Ok(CertificateInfo {
        not_before: timestamp(validity.not_before.timestamp())?,
        not_after: timestamp(validity.not_after.timestamp())?,
        subject: Subject::from_x509(cert.subject()),
    })
}

/// Splits a PEM chain into the leading (client) certificate and the
/// remaining CA certificates.
pub fn split_chain(chain_pem: &str) -> Result<(String, String), CertificateError> {
    let mut blocks = ::pem::parse_many(chain_pem.as_bytes())
        .map_err(|e| CertificateError::Parse(format!("invalid PEM: {e}")))?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE");

    let leaf = blocks
        .next()
        .ok_or_else(|| CertificateError::Parse("empty certificate chain".to_string()))?;
    let rest = blocks.collect::<Vec<_>>();

    let ca_chain = if rest.is_empty() {
        String::new()
    } else {
        ::pem::encode_many(&rest)
    };
    Ok((::pem::encode(&leaf), ca_chain))
}

// === impl Subject ===

impl Subject {
    pub fn common_name(&self) -> Option<&str> {
        self.get(SubjectField::CommonName)
    }

    pub fn get(&self, field: SubjectField) -> Option<&str> {
        self.0
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.as_str())
    }

    fn from_x509(name: &X509Name<'_>) -> Self {
        let mut fields = Vec::new();
        let mut push = |field: SubjectField, values: Vec<&str>| {
            fields.extend(values.into_iter().map(|v| (field, v.to_string())));
        };
        push(
            SubjectField::Organization,
            name.iter_organization().filter_map(|a| a.as_str().ok()).collect(),
        );
        push(
            SubjectField::OrganizationalUnit,
            name.iter_organizational_unit()
                .filter_map(|a| a.as_str().ok())
                .collect(),
        );
        push(
            SubjectField::Locality,
            name.iter_locality().filter_map(|a| a.as_str().ok()).collect(),
        );
        push(
            SubjectField::Province,
            name.iter_state_or_province()
                .filter_map(|a| a.as_str().ok())
                .collect(),
        );
        push(
            SubjectField::Country,
            name.iter_country().filter_map(|a| a.as_str().ok()).collect(),
        );
        push(
            SubjectField::CommonName,
            name.iter_common_name().filter_map(|a| a.as_str().ok()).collect(),
        );
        Self(fields)
    }

    fn distinguished_name(&self) -> Result<DistinguishedName, CertificateError> {
        let mut dn = DistinguishedName::new();
        for (field, value) in &self.0 {
            let (ty, value) = match field {
                SubjectField::Organization => {
                    (DnType::OrganizationName, DnValue::Utf8String(value.clone()))
                }
                SubjectField::OrganizationalUnit => (
                    DnType::OrganizationalUnitName,
                    DnValue::Utf8String(value.clone()),
                ),
                SubjectField::Locality => {
                    (DnType::LocalityName, DnValue::Utf8String(value.clone()))
                }
                SubjectField::Province => (
                    DnType::StateOrProvinceName,
                    DnValue::Utf8String(value.clone()),
                ),
                SubjectField::Country => {
                    let country = PrintableString::try_from(value.clone())
                        .map_err(|_| CertificateError::InvalidSubject(value.clone()))?;
                    (DnType::CountryName, DnValue::PrintableString(country))
                }
                SubjectField::CommonName => {
                    (DnType::CommonName, DnValue::Utf8String(value.clone()))
                }
            };
            dn.push(ty, value);
        }
        Ok(dn)
    }
}

impl FromStr for Subject {
    type Err = CertificateError;

    /// Parses a subject template such as `O=Org,OU=Unit,C=DE,CN=runtime`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| CertificateError::InvalidSubject(s.to_string()))?;
            let field = match key.trim() {
                "O" => SubjectField::Organization,
                "OU" => SubjectField::OrganizationalUnit,
                "L" => SubjectField::Locality,
                "ST" => SubjectField::Province,
                "C" => SubjectField::Country,
                "CN" => SubjectField::CommonName,
                _ => return Err(CertificateError::InvalidSubject(s.to_string())),
            };
            fields.push((field, value.trim().to_string()));
        }

        if !fields.iter().any(|(f, _)| *f == SubjectField::CommonName) {
            return Err(CertificateError::InvalidSubject(s.to_string()));
        }
        Ok(Self(fields))
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let key = match field {
                SubjectField::Organization => "O",
                SubjectField::OrganizationalUnit => "OU",
                SubjectField::Locality => "L",
                SubjectField::Province => "ST",
                SubjectField::Country => "C",
                SubjectField::CommonName => "CN",
            };
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

// === impl CertificateRequest ===

impl CertificateRequest {
    /// Generates a new private key and a CSR for `subject`.
    pub fn generate(subject: &Subject) -> Result<Self, CertificateError> {
        let key_pair = KeyPair::generate()
            .map_err(|e| CertificateError::Request(format!("failed to generate key: {e}")))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = subject.distinguished_name()?;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CertificateError::Request(e.to_string()))?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_der: csr.der().to_vec(),
        })
    }

    pub fn csr_der(&self) -> &[u8] {
        &self.csr_der
    }

    pub fn into_key_pem(self) -> String {
        self.key_pem
    }
}

// === impl CertificateError ===

impl CertificateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSubject(_) | Self::Parse(_) => ErrorKind::WrongInput,
            Self::Request(_) => ErrorKind::Internal,
        }
    }
}

// === impl RenewalError ===

impl RenewalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Certificate(e) => e.kind(),
            Self::Connector(e) => e.kind(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// Builds a self-signed certificate valid for 2024 only.
    pub(crate) fn self_signed(subject: &str) -> (String, String) {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name = subject
            .parse::<Subject>()
            .unwrap()
            .distinguished_name()
            .unwrap();
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2025, 1, 1);
        let cert = params.self_signed(&key_pair).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[test]
    fn renews_after_threshold() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let not_after = t0 + Duration::days(100);

        assert!(!should_renew(t0, not_after, t0 + Duration::days(29), 0.3));
        assert!(should_renew(t0, not_after, t0 + Duration::days(31), 0.3));
        assert!(should_renew(t0, not_after, t0 + Duration::days(200), 0.3));
    }

    #[test]
    fn renews_degenerate_lifetimes() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(should_renew(t0, t0, t0, 0.3));
        assert!(should_renew(t0, t0 - Duration::days(1), t0, 0.3));
    }

    #[test]
    fn parses_subject_template() {
        let subject = "O=Org,OU=OrgUnit,L=Waldorf,ST=Waldorf,C=DE,CN=runtime-1"
            .parse::<Subject>()
            .unwrap();
        assert_eq!(subject.common_name(), Some("runtime-1"));
        assert_eq!(subject.get(SubjectField::Country), Some("DE"));
        assert_eq!(
            subject.to_string(),
            "O=Org,OU=OrgUnit,L=Waldorf,ST=Waldorf,C=DE,CN=runtime-1"
        );
    }

    #[test]
    fn rejects_subject_without_common_name() {
        assert!(matches!(
            "O=Org,C=DE".parse::<Subject>(),
            Err(CertificateError::InvalidSubject(_))
        ));
        assert!(matches!(
            "O=Org,XX=1,CN=a".parse::<Subject>(),
            Err(CertificateError::InvalidSubject(_))
        ));
    }

    #[test]
    fn parses_validity_and_subject() {
        let (crt, _) = self_signed("O=Org,C=DE,CN=runtime-1");
        let info = parse_certificate(&crt).unwrap();
        assert_eq!(
            info.not_before,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            info.not_after,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(info.subject.common_name(), Some("runtime-1"));
        assert_eq!(info.subject.get(SubjectField::Organization), Some("Org"));
    }

    #[test]
    fn splits_leaf_from_chain() {
        let (leaf, _) = self_signed("CN=leaf");
        let (ca, _) = self_signed("CN=ca");
        let (client, chain) = split_chain(&format!("{leaf}{ca}")).unwrap();

        assert_eq!(
            parse_certificate(&client).unwrap().subject.common_name(),
            Some("leaf")
        );
        assert_eq!(
            parse_certificate(&chain).unwrap().subject.common_name(),
            Some("ca")
        );
        assert!(split_chain("").is_err());
    }

    #[test]
    fn request_carries_no_private_key() {
        let subject = "O=Org,CN=runtime-1".parse::<Subject>().unwrap();
        let request = CertificateRequest::generate(&subject).unwrap();
        assert!(!request.csr_der().is_empty());
        assert!(request.into_key_pem().contains("PRIVATE KEY"));
    }
}
