//! Routing: decide per destination whether to go direct or through
//! the relay. Pure and synchronous; never resolves DNS.

use crate::addr::TargetAddr;

/// How the host predicate steers traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    /// Matched hosts go direct, everything else is proxied.
    Whitelist,
    /// Matched hosts are proxied, everything else goes direct.
    Blacklist,
    /// Everything is proxied.
    Proxy,
}

impl RouteMode {
    /// Any string other than the two known modes forces full proxying.
    pub fn from_name(name: &str) -> RouteMode {
        match name {
            "whitelist" => RouteMode::Whitelist,
            "blacklist" => RouteMode::Blacklist,
            _ => RouteMode::Proxy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Direct,
    Proxied,
}

/// Suffix/exact host predicate. Rules like `*.cn`, `.cn` and `cn`
/// all match `a.cn` as well as `cn` itself.
pub struct HostMatcher {
    suffixes: Vec<String>,
}

impl HostMatcher {
    pub fn new<I, S>(rules: I) -> HostMatcher
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes = rules
            .into_iter()
            .map(|r| {
                let r = r.as_ref();
                r.trim_start_matches("*.").trim_start_matches('.').to_string()
            })
            .filter(|r| !r.is_empty())
            .collect();
        HostMatcher { suffixes }
    }

    pub fn matches(&self, host: &str) -> bool {
        self.suffixes.iter().any(|suffix| {
            host == suffix
                || (host.len() > suffix.len()
                    && host.ends_with(suffix.as_str())
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
        })
    }
}

pub struct Router {
    mode: RouteMode,
    matcher: HostMatcher,
}

impl Router {
    pub fn new(mode: RouteMode, matcher: HostMatcher) -> Router {
        Router { mode, matcher }
    }

    pub fn pick(&self, target: &TargetAddr) -> RouteDecision {
        let host = target.host_str();
        match self.mode {
            RouteMode::Whitelist => {
                if self.matcher.matches(&host) {
                    RouteDecision::Direct
                } else {
                    RouteDecision::Proxied
                }
            }
            RouteMode::Blacklist => {
                if self.matcher.matches(&host) {
                    RouteDecision::Proxied
                } else {
                    RouteDecision::Direct
                }
            }
            RouteMode::Proxy => RouteDecision::Proxied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> TargetAddr {
        TargetAddr::new(host, 80).unwrap()
    }

    #[test]
    fn test_route_mode_from_name() {
        assert_eq!(RouteMode::from_name("whitelist"), RouteMode::Whitelist);
        assert_eq!(RouteMode::from_name("blacklist"), RouteMode::Blacklist);
        assert_eq!(RouteMode::from_name(""), RouteMode::Proxy);
        assert_eq!(RouteMode::from_name("anything"), RouteMode::Proxy);
    }

    #[test]
    fn test_matcher_suffix_semantics() {
        let m = HostMatcher::new(["*.cn", "example.com"]);
        assert!(m.matches("cn"));
        assert!(m.matches("a.cn"));
        assert!(m.matches("b.a.cn"));
        assert!(!m.matches("acn"));
        assert!(!m.matches("a.com"));
        assert!(m.matches("example.com"));
        assert!(m.matches("www.example.com"));
        assert!(!m.matches("badexample.com"));

        let empty = HostMatcher::new(Vec::<String>::new());
        assert!(!empty.matches("a.cn"));
    }

    #[test]
    fn test_whitelist_routes_matched_direct() {
        let router = Router::new(RouteMode::Whitelist, HostMatcher::new(["*.cn"]));
        assert_eq!(router.pick(&target("a.cn")), RouteDecision::Direct);
        assert_eq!(router.pick(&target("a.com")), RouteDecision::Proxied);
    }

    #[test]
    fn test_blacklist_routes_matched_proxied() {
        let router = Router::new(RouteMode::Blacklist, HostMatcher::new(["*.cn"]));
        assert_eq!(router.pick(&target("a.cn")), RouteDecision::Proxied);
        assert_eq!(router.pick(&target("a.com")), RouteDecision::Direct);
    }

    #[test]
    fn test_other_modes_always_proxy() {
        let router = Router::new(RouteMode::Proxy, HostMatcher::new(["*.cn"]));
        assert_eq!(router.pick(&target("a.cn")), RouteDecision::Proxied);
        assert_eq!(router.pick(&target("a.com")), RouteDecision::Proxied);
    }
}
