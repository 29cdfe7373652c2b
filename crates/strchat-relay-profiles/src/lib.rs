#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelayProfileId {
    PublicChat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RelayProfile {
    pub id: RelayProfileId,
    pub name: &'static str,
    /// Used when a chat resolves to no anchor, discovered or geo relay at all.
    pub fallback_relays: &'static [&'static str],
    /// CSV of `host,lat,lon` rows used for nearest-relay lookups on geohash chats.
    pub georelay_dataset_url: &'static str,
}

impl RelayProfile {
    pub fn fallback_relays_vec(self) -> Vec<String> {
        self.fallback_relays
            .iter()
            .map(|v| (*v).to_string())
            .collect()
    }
}

pub const PUBLIC_CHAT: RelayProfile = RelayProfile {
    id: RelayProfileId::PublicChat,
    name: "public-chat",
    fallback_relays: &[
        "wss://relay.damus.io",
        "wss://relay.primal.net",
        "wss://offchain.pub",
        "wss://adre.su",
    ],
    georelay_dataset_url: "https://raw.githubusercontent.com/permissionlesstech/georelays/refs/heads/main/nostr_relays.csv",
};

pub fn default_profile() -> RelayProfile {
    PUBLIC_CHAT
}

pub fn default_fallback_relays() -> Vec<String> {
    default_profile().fallback_relays_vec()
}

pub fn default_georelay_dataset_url() -> &'static str {
    default_profile().georelay_dataset_url
}

/// Canonical form of a relay URL: lowercase scheme and host, no trailing
/// slash. Bare hosts get `wss://`. Anything that is not a websocket URL with
/// a host is rejected.
pub fn normalize_relay_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{trimmed}")
    };
    let parsed = url::Url::parse(&candidate).ok()?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return None;
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return None,
    }
    Some(parsed.as_str().trim_end_matches('/').to_string())
}

/// Discovery only ever accepts TLS websocket relays.
pub fn is_secure_relay_url(url: &str) -> bool {
    url.starts_with("wss://")
}

/// Normalize user-provided relay URLs, falling back to the given defaults
/// when none survive.
pub fn resolve_relays(values: &[String], defaults: &[&str]) -> Vec<String> {
    let mut parsed: Vec<String> = Vec::new();
    for raw in values {
        if let Some(url) = normalize_relay_url(raw) {
            if !parsed.contains(&url) {
                parsed.push(url);
            }
        }
    }
    if !parsed.is_empty() {
        return parsed;
    }
    defaults
        .iter()
        .filter_map(|u| normalize_relay_url(u))
        .collect()
}

/// Resolve relays using the public chat profile fallbacks.
pub fn relays_or_fallback(values: &[String]) -> Vec<String> {
    resolve_relays(values, default_profile().fallback_relays)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_profile_contains_expected_defaults() {
        let profile = default_profile();
        assert_eq!(profile.id, RelayProfileId::PublicChat);
        assert_eq!(profile.name, "public-chat");
        assert_eq!(
            profile.fallback_relays,
            &[
                "wss://relay.damus.io",
                "wss://relay.primal.net",
                "wss://offchain.pub",
                "wss://adre.su",
            ]
        );
        assert!(profile.georelay_dataset_url.ends_with("nostr_relays.csv"));
        assert_eq!(default_fallback_relays(), profile.fallback_relays_vec());
    }

    #[test]
    fn normalize_adds_scheme_and_strips_slash() {
        assert_eq!(
            normalize_relay_url("relay.example.com").as_deref(),
            Some("wss://relay.example.com")
        );
        assert_eq!(
            normalize_relay_url("  WSS://Relay.Example.com/  ").as_deref(),
            Some("wss://relay.example.com")
        );
        assert_eq!(
            normalize_relay_url("ws://127.0.0.1:7777").as_deref(),
            Some("ws://127.0.0.1:7777")
        );
    }

    #[test]
    fn normalize_rejects_non_websocket() {
        assert_eq!(normalize_relay_url(""), None);
        assert_eq!(normalize_relay_url("https://relay.example.com"), None);
        assert_eq!(normalize_relay_url("wss://"), None);
    }

    #[test]
    fn secure_check_only_accepts_wss() {
        assert!(is_secure_relay_url("wss://relay.example.com"));
        assert!(!is_secure_relay_url("ws://relay.example.com"));
    }

    #[test]
    fn relays_or_fallback_uses_provided() {
        let relays = vec![
            "relay.example.com".to_string(),
            "wss://relay.example.com/".to_string(),
        ];
        assert_eq!(relays_or_fallback(&relays), vec!["wss://relay.example.com"]);
    }

    #[test]
    fn relays_or_fallback_skips_invalid_and_falls_back() {
        let relays = vec!["".to_string(), "https://nope.example".to_string()];
        assert_eq!(relays_or_fallback(&relays), default_fallback_relays());
    }
}
