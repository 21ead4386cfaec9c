use url::Url;

use crate::Result;

/// Where a route is reachable. Derived from names only, so it is the same on every reconcile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDomains {
    pub domain: String,
    pub domain_internal: String,
    pub url: Url,
}

impl RouteDomains {
    pub fn new(route_name: &str, namespace: &str, domain_suffix: &str) -> Result<Self> {
        let domain = format!("{route_name}.{namespace}.{domain_suffix}");
        let url = Url::parse(&format!("http://{domain}"))?;

        Ok(Self {
            domain_internal: format!("{route_name}.{namespace}.svc.cluster.local"),
            domain,
            url,
        })
    }

    /// The domain on which the named target `name` is reachable by itself
    pub fn target_domain(&self, name: &str) -> String {
        format!("{name}.{}", self.domain)
    }
}
