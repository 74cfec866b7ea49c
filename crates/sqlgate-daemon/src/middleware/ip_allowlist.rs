//! Client-IP allow-list enforced as a tower layer.
//!
//! Entries are single addresses or CIDR blocks. An empty list disables the
//! filter. Client resolution order: X-Forwarded-For, X-Real-IP, socket peer.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use serde::Serialize;
use tower::{Layer, Service};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct IpAllowlist {
    entries: Vec<AllowEntry>,
}

#[derive(Debug, Clone, Copy)]
enum AllowEntry {
    Single(IpAddr),
    Network { base: u128, prefix: u32, v4: bool },
}

impl IpAllowlist {
    /// Parses a mixed list of addresses (`10.1.2.3`, `::1`) and CIDR blocks
    /// (`10.0.0.0/8`). Invalid entries are configuration errors.
    pub fn parse(items: &[String]) -> Result<Self> {
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            if let Some((address, prefix)) = item.split_once('/') {
                let address: IpAddr = address
                    .parse()
                    .map_err(|_| anyhow!("invalid CIDR base address '{item}'"))?;
                let prefix: u32 = prefix
                    .parse()
                    .map_err(|_| anyhow!("invalid CIDR prefix '{item}'"))?;
                let (base, v4) = ip_bits(address);
                let width = if v4 { 32 } else { 128 };
                if prefix > width {
                    return Err(anyhow!("CIDR prefix out of range in '{item}'"));
                }
                entries.push(AllowEntry::Network { base, prefix, v4 });
            } else {
                let address: IpAddr = item
                    .parse()
                    .map_err(|_| anyhow!("invalid IP address '{item}'"))?;
                entries.push(AllowEntry::Single(address));
            }
        }
        Ok(Self { entries })
    }

    pub fn is_enabled(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let (bits, v4) = ip_bits(ip);
        self.entries.iter().any(|entry| match entry {
            AllowEntry::Single(allowed) => *allowed == ip,
            AllowEntry::Network {
                base,
                prefix,
                v4: net_v4,
            } => {
                if v4 != *net_v4 {
                    return false;
                }
                let width = if v4 { 32 } else { 128 };
                let mask = prefix_mask(*prefix, width);
                (bits & mask) == (base & mask)
            }
        })
    }
}

fn ip_bits(ip: IpAddr) -> (u128, bool) {
    match ip {
        IpAddr::V4(v4) => (u128::from(u32::from(v4)), true),
        IpAddr::V6(v6) => (u128::from(v6), false),
    }
}

/// High-order mask of `prefix` ones over an address of `width` bits.
fn prefix_mask(prefix: u32, width: u32) -> u128 {
    if prefix == 0 {
        0
    } else if prefix >= width {
        if width == 128 {
            u128::MAX
        } else {
            (1u128 << width) - 1
        }
    } else {
        ((1u128 << prefix) - 1) << (width - prefix)
    }
}

pub fn ip_allowlist_layer(allowlist: IpAllowlist) -> IpAllowlistLayer {
    IpAllowlistLayer {
        allowlist: Arc::new(allowlist),
    }
}

#[derive(Clone)]
pub struct IpAllowlistLayer {
    allowlist: Arc<IpAllowlist>,
}

impl<S> Layer<S> for IpAllowlistLayer {
    type Service = IpAllowlistService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IpAllowlistService {
            inner,
            allowlist: self.allowlist.clone(),
        }
    }
}

#[derive(Clone)]
pub struct IpAllowlistService<S> {
    inner: S,
    allowlist: Arc<IpAllowlist>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for IpAllowlistService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let allowlist = self.allowlist.clone();

        Box::pin(async move {
            if !allowlist.is_enabled() {
                return inner.call(request).await;
            }
            match client_ip(&request) {
                Some(ip) if allowlist.allows(ip) => inner.call(request).await,
                resolved => {
                    warn!(client_ip = ?resolved, "request rejected by IP allow-list");
                    Ok(IpRejection.into_response())
                }
            }
        })
    }
}

struct IpRejection;

impl IntoResponse for IpRejection {
    fn into_response(self) -> Response {
        let body = IpRejectionBody {
            error: "ip_not_allowed",
        };
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct IpRejectionBody {
    error: &'static str,
}

fn client_ip<B>(request: &Request<B>) -> Option<IpAddr> {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return Some(ip);
            }
        }
    }

    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        if let Ok(ip) = real_ip.trim().parse() {
            return Some(ip);
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn allowlist(items: &[&str]) -> IpAllowlist {
        let items: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        IpAllowlist::parse(&items).unwrap()
    }

    #[test]
    fn empty_list_allows_everything() {
        let list = allowlist(&[]);
        assert!(!list.is_enabled());
        assert!(list.allows("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn single_addresses_match_exactly() {
        let list = allowlist(&["127.0.0.1", "::1"]);
        assert!(list.allows("127.0.0.1".parse().unwrap()));
        assert!(list.allows("::1".parse().unwrap()));
        assert!(!list.allows("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn cidr_blocks_match_their_range() {
        let list = allowlist(&["10.0.0.0/8", "192.168.1.0/24"]);
        assert!(list.allows("10.200.3.4".parse().unwrap()));
        assert!(list.allows("192.168.1.77".parse().unwrap()));
        assert!(!list.allows("192.168.2.1".parse().unwrap()));
        assert!(!list.allows("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn families_do_not_cross_match() {
        let list = allowlist(&["10.0.0.0/8"]);
        assert!(!list.allows("::a00:1".parse().unwrap()));
    }

    #[test]
    fn invalid_entries_fail_at_parse_time() {
        assert!(IpAllowlist::parse(&["not-an-ip".to_string()]).is_err());
        assert!(IpAllowlist::parse(&["10.0.0.0/33".to_string()]).is_err());
    }

    #[test]
    fn forwarded_header_wins_over_peer_address() {
        let request = Request::builder()
            .uri("/api/v1/sql")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(
            client_ip(&request),
            Some("203.0.113.7".parse().unwrap())
        );
    }

    #[test]
    fn real_ip_header_is_the_fallback() {
        let request = Request::builder()
            .uri("/api/v1/sql")
            .header("x-real-ip", "198.51.100.4")
            .body(())
            .unwrap();
        assert_eq!(
            client_ip(&request),
            Some("198.51.100.4".parse().unwrap())
        );
    }
}
