pub const CLOUDCODE_HOST_DAILY: &str = "daily-cloudcode-pa.googleapis.com";
pub const CLOUDCODE_HOST_PUBLIC: &str = "cloudcode-pa.googleapis.com";

/// One interchangeable upstream base. The colon-method URL style follows
/// the v1internal surface (`{base}:{method}?{query}`).
#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    pub base_url: String,
    pub host: String,
}

impl ApiEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let host = base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self { base_url, host }
    }

    fn method_url(&self, method: &str, query: Option<&str>) -> String {
        match query {
            Some(qs) => format!("{}:{}?{}", self.base_url, method, qs),
            None => format!("{}:{}", self.base_url, method),
        }
    }

    pub fn generate_content_url(&self) -> String {
        self.method_url("generateContent", None)
    }

    pub fn stream_generate_url(&self) -> String {
        self.method_url("streamGenerateContent", Some("alt=sse"))
    }

    pub fn models_list_url(&self) -> String {
        self.method_url("fetchAvailableModels", None)
    }

    pub fn load_code_assist_url(&self) -> String {
        self.method_url("loadCodeAssist", None)
    }

    pub fn onboard_user_url(&self) -> String {
        self.method_url("onboardUser", None)
    }
}

/// Ordered failover bases for one provider; the dispatch engine walks the
/// table by ordinal index as the second dimension of the retry matrix.
#[derive(Debug, Clone)]
pub struct EndpointTable {
    endpoints: Vec<ApiEndpoint>,
}

impl EndpointTable {
    /// Daily host first: the public host rate-limits the project-mint calls
    /// far more aggressively.
    pub fn antigravity_default() -> Self {
        Self::from_base_urls(&[
            format!("https://{}/v1internal", CLOUDCODE_HOST_DAILY),
            format!("https://{}/v1internal", CLOUDCODE_HOST_PUBLIC),
        ])
    }

    pub fn from_base_urls<S: AsRef<str>>(urls: &[S]) -> Self {
        Self {
            endpoints: urls.iter().map(|u| ApiEndpoint::new(u.as_ref())).collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&ApiEndpoint> {
        self.endpoints.get(index)
    }

    pub fn first(&self) -> &ApiEndpoint {
        &self.endpoints[0]
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_method_urls_are_built_correctly() {
        let endpoint = ApiEndpoint::new("https://cloudcode-pa.googleapis.com/v1internal");
        assert_eq!(
            endpoint.generate_content_url(),
            "https://cloudcode-pa.googleapis.com/v1internal:generateContent"
        );
        assert_eq!(
            endpoint.stream_generate_url(),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
        assert_eq!(endpoint.host, "cloudcode-pa.googleapis.com");
    }

    #[test]
    fn default_table_prefers_the_daily_host() {
        let table = EndpointTable::antigravity_default();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).unwrap().host, CLOUDCODE_HOST_DAILY);
        assert_eq!(table.get(1).unwrap().host, CLOUDCODE_HOST_PUBLIC);
    }
}
