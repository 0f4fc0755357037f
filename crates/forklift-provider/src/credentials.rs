//! Provider credentials and endpoint checks
//!
//! Settings come from two places: `spec.settings` and the credentials
//! secret. The secret only contributes the keys below; anything else it
//! carries (thumbprints, kubeconfigs) belongs to other consumers.

use std::collections::BTreeMap;

use forklift_common::crd::{Provider, ProviderSettings, ProviderType};
use forklift_common::Result;
use k8s_openapi::api::core::v1::Secret;
use reqwest::Url;

const SECRET_KEYS: &[&str] = &[
    "url",
    "user",
    "password",
    "cacert",
    "insecureSkipVerify",
    "token",
    "domainName",
    "projectName",
    "regionName",
];

/// Decoded secret contents; `stringData` wins over `data`
pub fn secret_data(secret: &Secret) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    if let Some(strings) = &secret.string_data {
        out.extend(strings.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}

/// Provider settings merged with the credentials secret
///
/// Secret values override `spec.settings`; `spec.url` fills the URL when
/// neither names one.
pub fn merged_settings(provider: &Provider, secret: Option<&Secret>) -> Result<ProviderSettings> {
    let mut options = provider.spec.settings.clone();
    if let Some(secret) = secret {
        for (key, value) in secret_data(secret) {
            if SECRET_KEYS.contains(&key.as_str()) {
                options.insert(key, value);
            }
        }
    }
    if !provider.spec.url.is_empty() {
        options
            .entry("url".to_string())
            .or_insert_with(|| provider.spec.url.clone());
    }
    ProviderSettings::parse(&options)
}

/// The credential a provider type cannot work without, if it is missing
pub fn missing_credential(
    type_: ProviderType,
    settings: &ProviderSettings,
) -> Option<&'static str> {
    let has_login = settings.username.is_some() && settings.password.is_some();
    match type_ {
        ProviderType::VSphere | ProviderType::Ovirt | ProviderType::HyperV => {
            if settings.username.is_none() {
                Some("user")
            } else if settings.password.is_none() {
                Some("password")
            } else {
                None
            }
        }
        ProviderType::OpenStack if !has_login && settings.token.is_none() => Some("token"),
        ProviderType::OpenShift if settings.token.is_none() => Some("token"),
        _ => None,
    }
}

/// Check that `url` is a usable endpoint for the provider type
///
/// OVA providers name an NFS export (`server:/path` or `nfs://server/path`);
/// every other type needs an absolute http(s) URL with a host.
pub fn check_url(type_: ProviderType, url: &str) -> std::result::Result<(), String> {
    if url.is_empty() {
        return Err("url is required".to_string());
    }
    if type_ == ProviderType::Ova {
        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "nfs" && parsed.host_str().is_some() {
                return Ok(());
            }
        }
        return match url.split_once(':') {
            Some((host, path)) if !host.is_empty() && path.starts_with('/') => Ok(()),
            _ => Err(format!("'{url}' is not an NFS export (server:/path)")),
        };
    }
    let parsed = Url::parse(url).map_err(|e| format!("'{url}': {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("'{url}': scheme must be http or https"));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(format!("'{url}': missing host"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_common::crd::ProviderSpec;
    use forklift_common::Reason;
    use k8s_openapi::ByteString;
    use rstest::rstest;

    fn secret(pairs: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn provider(type_: ProviderType, settings: &[(&str, &str)]) -> Provider {
        Provider::new(
            "source",
            ProviderSpec {
                type_,
                url: "https://vcenter.example.com/sdk".into(),
                secret: None,
                settings: settings
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        )
    }

    /// Story: Credentials from the secret land next to the spec's tuning options
    #[test]
    fn story_secret_credentials_merge_with_spec_settings() {
        let p = provider(ProviderType::VSphere, &[("vddkInitImage", "registry/vddk:8")]);
        let s = secret(&[
            ("user", "administrator@vsphere.local"),
            ("password", "secret"),
            ("thumbprint", "AA:BB"),
        ]);

        let settings = merged_settings(&p, Some(&s)).unwrap();
        assert_eq!(settings.username.as_deref(), Some("administrator@vsphere.local"));
        assert_eq!(settings.vddk_init_image.as_deref(), Some("registry/vddk:8"));
        assert_eq!(settings.url.as_deref(), Some("https://vcenter.example.com/sdk"));
        assert_eq!(missing_credential(ProviderType::VSphere, &settings), None);
    }

    #[test]
    fn string_data_overrides_data() {
        let mut s = secret(&[("user", "old")]);
        s.string_data = Some([("user".to_string(), "new".to_string())].into());
        assert_eq!(secret_data(&s)["user"], "new");
    }

    #[test]
    fn unknown_spec_settings_are_still_rejected() {
        let p = provider(ProviderType::VSphere, &[("vddkThreads", "4")]);
        let err = merged_settings(&p, None).unwrap_err();
        assert_eq!(err.reason(), Reason::UnknownProviderSetting);
    }

    #[rstest]
    #[case::vsphere_without_password(ProviderType::VSphere, &[("user", "admin")], Some("password"))]
    #[case::ovirt_without_user(ProviderType::Ovirt, &[], Some("user"))]
    #[case::openstack_token(ProviderType::OpenStack, &[("token", "t")], None)]
    #[case::openstack_nothing(ProviderType::OpenStack, &[], Some("token"))]
    #[case::ova_needs_nothing(ProviderType::Ova, &[], None)]
    fn required_credentials(
        #[case] type_: ProviderType,
        #[case] pairs: &[(&str, &str)],
        #[case] missing: Option<&str>,
    ) {
        let p = provider(type_, &[]);
        let settings = merged_settings(&p, Some(&secret(pairs))).unwrap();
        assert_eq!(missing_credential(type_, &settings), missing);
    }

    #[rstest]
    #[case::vcenter(ProviderType::VSphere, "https://vcenter.example.com/sdk", true)]
    #[case::no_scheme(ProviderType::VSphere, "vcenter.example.com", false)]
    #[case::ftp(ProviderType::Ovirt, "ftp://engine/api", false)]
    #[case::empty(ProviderType::OpenStack, "", false)]
    #[case::nfs_export(ProviderType::Ova, "nfs.example.com:/exports/ova", true)]
    #[case::nfs_url(ProviderType::Ova, "nfs://nfs.example.com/exports/ova", true)]
    #[case::relative_export(ProviderType::Ova, "nfs.example.com:exports", false)]
    fn url_checks(#[case] type_: ProviderType, #[case] url: &str, #[case] ok: bool) {
        assert_eq!(check_url(type_, url).is_ok(), ok, "{url}");
    }
}
