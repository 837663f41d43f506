use std::collections::BTreeMap;

const UTM_KEYS: [&str; 5] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
];

/// Client metadata extracted from an inbound issue/redeem request by the web
/// layer and handed to the scorer. The core never touches the request itself.
#[derive(Debug, Clone, Default)]
pub struct ActorContext {
    pub ip: Option<String>,
    pub user_agent: String,
    pub utm: BTreeMap<String, String>,
}

impl ActorContext {
    /// Builds a context from raw request parts: the ip is the first entry of
    /// the forwarded-for header when present, else the peer address; utm
    /// parameters are collected from the query/body map, non-empty ones only.
    pub fn new(
        forwarded_for: Option<&str>,
        remote_addr: Option<&str>,
        user_agent: Option<&str>,
        params: &BTreeMap<String, String>,
    ) -> Self {
        let forwarded = forwarded_for
            .and_then(|h| h.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let ip = forwarded.or_else(|| {
            remote_addr
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        });

        let mut utm = BTreeMap::new();
        for key in UTM_KEYS {
            if let Some(value) = params.get(key) {
                if !value.is_empty() {
                    utm.insert(key.to_string(), value.clone());
                }
            }
        }

        Self {
            ip,
            user_agent: user_agent.unwrap_or_default().to_string(),
            utm,
        }
    }

    pub fn with_ip(ip: &str) -> Self {
        Self {
            ip: Some(ip.to_string()),
            ..Self::default()
        }
    }
}
