// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resolving the tenant of a request and normalizing it into the canonical
//! header.

use bytes::Bytes;

use crate::config::TenancyOptions;
use crate::error::{Error, Result};

/// The canonical header carrying the tenant towards the downstream.
pub const DEFAULT_TENANT_HEADER: &str = "THANOS-TENANT";
/// Tenant assumed when nothing else yields one.
pub const DEFAULT_TENANT: &str = "default-tenant";

pub const CERT_FIELD_ORGANIZATION: &str = "organization";
pub const CERT_FIELD_ORGANIZATIONAL_UNIT: &str = "organizationalUnit";
pub const CERT_FIELD_COMMON_NAME: &str = "commonName";

/// Subject fields of the verified client certificate. The embedded HTTP
/// server attaches this as a request extension when TLS client auth is on.
#[derive(Debug, Clone, Default)]
pub struct TlsClientSubject {
    pub organization: Vec<String>,
    pub organizational_unit: Vec<String>,
    pub common_name: String,
}

/// A tenant must be a single path element.
pub fn is_tenant_valid(tenant: &str) -> Result<()> {
    if tenant.is_empty() || tenant.contains('/') || tenant.contains('\\') {
        return Err(Error::InvalidTenant {
            tenant: tenant.to_string(),
        });
    }
    Ok(())
}

/// Resolves the tenant of a request: the configured header first, then the
/// canonical header, then the default tenant. A configured certificate field
/// overrides headers entirely.
pub fn tenant_from_http(req: &http::Request<Bytes>, opts: &TenancyOptions) -> Result<String> {
    let header_value = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    };

    let mut tenant = header_value(&opts.tenant_header)
        .or_else(|| header_value(DEFAULT_TENANT_HEADER))
        .unwrap_or_else(|| opts.default_tenant_id.clone());

    if !opts.tenant_cert_field.is_empty() {
        tenant = tenant_from_certificate(req, &opts.tenant_cert_field)?;
    }

    is_tenant_valid(&tenant)?;
    Ok(tenant)
}

fn tenant_from_certificate(req: &http::Request<Bytes>, field: &str) -> Result<String> {
    let subject = req
        .extensions()
        .get::<TlsClientSubject>()
        .ok_or_else(|| Error::InvalidTenant {
            tenant: "<no client certificate>".to_string(),
        })?;

    let tenant = match field {
        CERT_FIELD_ORGANIZATION => subject.organization.first().cloned(),
        CERT_FIELD_ORGANIZATIONAL_UNIT => subject.organizational_unit.first().cloned(),
        CERT_FIELD_COMMON_NAME => {
            Some(subject.common_name.clone()).filter(|name| !name.is_empty())
        }
        _ => {
            return Err(Error::Internal {
                err_msg: format!("unsupported tenant certificate field {field:?}"),
            })
        }
    };

    tenant.ok_or_else(|| Error::InvalidTenant {
        tenant: format!("<missing {field} in client certificate>"),
    })
}

/// Rewrites the request headers so only the canonical tenant header remains,
/// and returns the tenant. Every request entering the pipelines goes through
/// this first.
pub fn normalize_tenant(req: &mut http::Request<Bytes>, opts: &TenancyOptions) -> Result<String> {
    let tenant = tenant_from_http(req, opts)?;

    let value = http::header::HeaderValue::try_from(tenant.as_str()).map_err(|_| {
        Error::InvalidTenant {
            tenant: tenant.clone(),
        }
    })?;
    req.headers_mut()
        .insert(http::header::HeaderName::from_static("thanos-tenant"), value);
    if !opts.tenant_header.is_empty()
        && !opts.tenant_header.eq_ignore_ascii_case(DEFAULT_TENANT_HEADER)
    {
        req.headers_mut().remove(opts.tenant_header.as_str());
    }

    Ok(tenant)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> http::Request<Bytes> {
        let mut builder = http::Request::builder().uri("/api/v1/query");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Bytes::new()).unwrap()
    }

    fn options(custom_header: &str) -> TenancyOptions {
        TenancyOptions {
            tenant_header: custom_header.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_custom_header_wins() {
        let req = request(&[
            ("X-Scope-OrgID", "team-a"),
            (DEFAULT_TENANT_HEADER, "team-b"),
        ]);
        let tenant = tenant_from_http(&req, &options("X-Scope-OrgID")).unwrap();
        assert_eq!(tenant, "team-a");
    }

    #[test]
    fn test_fallback_chain() {
        let req = request(&[(DEFAULT_TENANT_HEADER, "team-b")]);
        assert_eq!(
            tenant_from_http(&req, &options("X-Scope-OrgID")).unwrap(),
            "team-b"
        );

        let req = request(&[]);
        assert_eq!(
            tenant_from_http(&req, &options("X-Scope-OrgID")).unwrap(),
            DEFAULT_TENANT
        );
    }

    #[test]
    fn test_tenant_with_path_separator_rejected() {
        let req = request(&[("X-Scope-OrgID", "foo/bar")]);
        assert!(matches!(
            tenant_from_http(&req, &options("X-Scope-OrgID")),
            Err(Error::InvalidTenant { .. })
        ));
    }

    #[test]
    fn test_certificate_field_overrides_headers() {
        let mut req = request(&[("X-Scope-OrgID", "from-header")]);
        req.extensions_mut().insert(TlsClientSubject {
            organization: vec!["cert-org".to_string()],
            ..Default::default()
        });
        let mut opts = options("X-Scope-OrgID");
        opts.tenant_cert_field = CERT_FIELD_ORGANIZATION.to_string();

        assert_eq!(tenant_from_http(&req, &opts).unwrap(), "cert-org");
    }

    #[test]
    fn test_certificate_field_missing_fails() {
        let req = request(&[]);
        let mut opts = options("X-Scope-OrgID");
        opts.tenant_cert_field = CERT_FIELD_COMMON_NAME.to_string();
        assert!(tenant_from_http(&req, &opts).is_err());
    }

    #[test]
    fn test_normalize_rewrites_headers() {
        let mut req = request(&[("X-Scope-OrgID", "foo")]);
        let tenant = normalize_tenant(&mut req, &options("X-Scope-OrgID")).unwrap();

        assert_eq!(tenant, "foo");
        assert_eq!(req.headers().get(DEFAULT_TENANT_HEADER).unwrap(), "foo");
        assert!(req.headers().get("X-Scope-OrgID").is_none());
    }
}
