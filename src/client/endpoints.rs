use crate::core::types::EndpointHealth;

/// One candidate server endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub region: String,
    pub url: String,
    pub demo: bool,
    pub health: EndpointHealth,
}

impl Endpoint {
    pub fn new(region: impl Into<String>, url: impl Into<String>, demo: bool) -> Self {
        Self {
            region: region.into(),
            url: url.into(),
            demo,
            health: EndpointHealth::Unknown,
        }
    }
}

fn region_url(host: &str) -> String {
    format!("wss://{host}.po.market/socket.io/?EIO=4&transport=websocket")
}

/// Built-in region catalogue, in priority order.
pub fn default_endpoints(demo: bool) -> Vec<Endpoint> {
    if demo {
        vec![
            Endpoint::new("DEMO", region_url("demo-api-eu"), true),
            Endpoint::new("DEMO_2", region_url("try-demo-eu"), true),
        ]
    } else {
        vec![
            Endpoint::new("EUROPA", region_url("api-eu"), false),
            Endpoint::new("SEYCHELLES", region_url("api-sc"), false),
            Endpoint::new("HONGKONG", region_url("api-hk"), false),
            Endpoint::new("FRANCE", region_url("api-fr"), false),
            Endpoint::new("UNITED_STATES", region_url("api-us-north"), false),
            Endpoint::new("RUSSIA", region_url("api-msk"), false),
            Endpoint::new("INDIA", region_url("api-in"), false),
            Endpoint::new("LATAM", region_url("api-la"), false),
        ]
    }
}

/// Deterministic endpoint selection: cycle once through the ranked list, and
/// after a successful authentication pin that endpoint so reconnects try it
/// first until it fails again.
#[derive(Debug)]
pub struct EndpointSelector {
    endpoints: Vec<Endpoint>,
    cursor: usize,
    pinned: Option<usize>,
    /// Set once the pinned endpoint has been handed out for the current pass.
    pinned_tried: bool,
}

impl EndpointSelector {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            cursor: 0,
            pinned: None,
            pinned_tried: false,
        }
    }

    /// Restrict to named regions, keeping the configured priority order.
    pub fn filtered(endpoints: Vec<Endpoint>, regions: &[String]) -> Self {
        if regions.is_empty() {
            return Self::new(endpoints);
        }
        let filtered = regions
            .iter()
            .filter_map(|name| {
                endpoints
                    .iter()
                    .find(|e| e.region.eq_ignore_ascii_case(name))
                    .cloned()
            })
            .collect();
        Self::new(filtered)
    }

    /// Next endpoint to try, or `None` once every candidate has been handed
    /// out in this pass.
    pub fn next(&mut self) -> Option<Endpoint> {
        if let Some(pinned) = self.pinned {
            if !self.pinned_tried {
                self.pinned_tried = true;
                return self.endpoints.get(pinned).cloned();
            }
        }

        while self.cursor < self.endpoints.len() {
            let idx = self.cursor;
            self.cursor += 1;
            // The pinned endpoint already went first this pass.
            if self.pinned == Some(idx) && self.pinned_tried {
                continue;
            }
            return self.endpoints.get(idx).cloned();
        }
        None
    }

    /// Start a fresh pass over the candidates.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.pinned_tried = false;
    }

    /// Record a successful authentication: pin the endpoint as preferred and
    /// mark it healthy.
    pub fn mark_success(&mut self, url: &str) {
        if let Some(idx) = self.endpoints.iter().position(|e| e.url == url) {
            self.endpoints[idx].health = EndpointHealth::Healthy;
            self.pinned = Some(idx);
        }
    }

    /// Record a failure. A failing pinned endpoint loses its preference and
    /// selection falls back to cycling.
    pub fn mark_failure(&mut self, url: &str) {
        if let Some(idx) = self.endpoints.iter().position(|e| e.url == url) {
            self.endpoints[idx].health = EndpointHealth::Unhealthy;
            if self.pinned == Some(idx) {
                self.pinned = None;
            }
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> EndpointSelector {
        EndpointSelector::new(vec![
            Endpoint::new("A", "wss://a", false),
            Endpoint::new("B", "wss://b", false),
            Endpoint::new("C", "wss://c", false),
        ])
    }

    #[test]
    fn cycles_once_then_exhausts() {
        let mut sel = selector();
        let order: Vec<String> = std::iter::from_fn(|| sel.next().map(|e| e.region)).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert!(sel.next().is_none());
    }

    #[test]
    fn pinned_endpoint_goes_first_after_success() {
        let mut sel = selector();
        sel.next();
        let b = sel.next().unwrap();
        sel.mark_success(&b.url);

        sel.reset();
        assert_eq!(sel.next().unwrap().region, "B");
        assert_eq!(sel.next().unwrap().region, "A");
        assert_eq!(sel.next().unwrap().region, "C");
        assert!(sel.next().is_none());
    }

    #[test]
    fn failed_pin_falls_back_to_cycling() {
        let mut sel = selector();
        let a = sel.next().unwrap();
        sel.mark_success(&a.url);
        sel.mark_failure(&a.url);

        sel.reset();
        assert_eq!(sel.next().unwrap().region, "A");
        assert_eq!(sel.next().unwrap().region, "B");
        assert_eq!(sel.endpoints()[0].health, EndpointHealth::Unhealthy);
    }

    #[test]
    fn region_filter_preserves_order_and_ignores_unknown() {
        let mut sel = EndpointSelector::filtered(
            selector().endpoints.clone(),
            &["c".to_string(), "A".to_string(), "nope".to_string()],
        );
        assert_eq!(sel.next().unwrap().region, "C");
        assert_eq!(sel.next().unwrap().region, "A");
        assert!(sel.next().is_none());
    }
}
