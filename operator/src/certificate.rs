/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Client certificates used by a ControlPlane to reach the admin API of its
//! DataPlane, signed by the cluster CA.

use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::Secret, ByteString};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose,
};

use crate::{Error, Result};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";

// PEM encoded CA material read from the cluster CA Secret.
pub struct ClusterCa {
    pub cert_pem: String,
    pub key_pem: String,
}

fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| Error::CertificateError(format!("CA secret has no {key}")))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|e| Error::CertificateError(format!("CA secret {key} is not PEM: {e}")))
}

impl ClusterCa {
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        Ok(ClusterCa {
            cert_pem: secret_value(secret, TLS_CERT_KEY)?,
            key_pem: secret_value(secret, TLS_KEY_KEY)?,
        })
    }
}

// An issued client certificate, ready to be stored as a kubernetes.io/tls Secret.
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

impl IssuedCertificate {
    pub fn secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (TLS_CERT_KEY.to_string(), ByteString(self.cert_pem.clone().into_bytes())),
            (TLS_KEY_KEY.to_string(), ByteString(self.key_pem.clone().into_bytes())),
            (CA_CERT_KEY.to_string(), ByteString(self.ca_pem.clone().into_bytes())),
        ])
    }
}

// Issues a client authentication certificate for `common_name`.
pub fn issue_client_certificate(ca: &ClusterCa, common_name: &str) -> Result<IssuedCertificate> {
    let ca_key = KeyPair::from_pem(&ca.key_pem)?;
    let ca_cert = CertificateParams::from_ca_cert_pem(&ca.cert_pem)?.self_signed(&ca_key)?;

    let mut params = CertificateParams::new(vec![common_name.to_string()])?;
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, &ca_cert, &ca_key)?;

    Ok(IssuedCertificate {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        ca_pem: ca.cert_pem.clone(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::{BasicConstraints, IsCa};

    // Builds a self-signed CA Secret.
    pub(crate) fn ca_secret(namespace: &str, name: &str) -> Secret {
        let mut params = CertificateParams::new(vec![]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "test cluster CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        Secret {
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(BTreeMap::from([
                (TLS_CERT_KEY.to_string(), ByteString(cert.pem().into_bytes())),
                (TLS_KEY_KEY.to_string(), ByteString(key.serialize_pem().into_bytes())),
            ])),
            ..Default::default()
        }
    }

    #[test]
    fn issues_certificate_signed_by_ca() {
        let secret = ca_secret("kong-system", "ca");
        let ca = ClusterCa::from_secret(&secret).unwrap();
        let issued = issue_client_certificate(&ca, "cp.default").unwrap();

        assert!(issued.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));
        assert_eq!(issued.ca_pem, ca.cert_pem);

        let data = issued.secret_data();
        assert_eq!(data.len(), 3);
        assert!(data.contains_key(CA_CERT_KEY));
    }

    #[test]
    fn missing_ca_material_is_reported() {
        let mut secret = ca_secret("kong-system", "ca");
        secret.data.as_mut().unwrap().remove(TLS_KEY_KEY);
        assert!(matches!(
            ClusterCa::from_secret(&secret),
            Err(Error::CertificateError(_))
        ));
    }
}
