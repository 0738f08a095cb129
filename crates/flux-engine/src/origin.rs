use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use image::ImageFormat;
use reqwest::Url;
use thiserror::Error;

pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_LOOKUPS_IN_FLIGHT: usize = 8;

const SNIFF_BYTES: u64 = 64;
const BLOCKED_EXACT_HOSTS: [&str; 2] = ["metadata", "instance-data"];
const BLOCKED_HOST_FRAGMENTS: [&str; 2] = ["localhost", "metadata.google.internal"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    NotHttps,
    HostnameBlocklisted,
    LiteralPrivateAddress,
    ResolvesToPrivateAddress,
    Ipv4MappedIpv6Bypass,
    MalformedUrl,
    ResolutionFailed,
    FileNotFound,
    NotAFile,
    UnrecognizedImage,
    Unreadable,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotHttps => "not_https",
            Self::HostnameBlocklisted => "hostname_blocklisted",
            Self::LiteralPrivateAddress => "literal_private_address",
            Self::ResolvesToPrivateAddress => "resolves_to_private_address",
            Self::Ipv4MappedIpv6Bypass => "ipv4_mapped_ipv6_bypass",
            Self::MalformedUrl => "malformed_url",
            Self::ResolutionFailed => "resolution_failed",
            Self::FileNotFound => "file_not_found",
            Self::NotAFile => "not_a_file",
            Self::UnrecognizedImage => "unrecognized_image",
            Self::Unreadable => "unreadable",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OriginRejection {
    pub reason: RejectionReason,
    pub message: String,
}

impl OriginRejection {
    fn new(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Verdict for one candidate URL or path. Computed fresh on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginClassification {
    Allowed,
    Rejected(OriginRejection),
}

impl OriginClassification {
    fn rejected(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self::Rejected(OriginRejection::new(reason, message))
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn rejection(&self) -> Option<&OriginRejection> {
        match self {
            Self::Allowed => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }

    pub fn reason(&self) -> Option<RejectionReason> {
        self.rejection().map(|rejection| rejection.reason)
    }

    pub fn into_result(self) -> Result<(), OriginRejection> {
        match self {
            Self::Allowed => Ok(()),
            Self::Rejected(rejection) => Err(rejection),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Public,
    Loopback,
    Private,
    LinkLocal,
    UniqueLocal,
    Unspecified,
}

impl AddressClass {
    pub fn is_public(&self) -> bool {
        matches!(self, Self::Public)
    }
}

/// Classifies an address. IPv6 forms that carry an IPv4 address are
/// unwrapped first (see [`embedded_ipv4`]).
pub fn classify_ip(ip: IpAddr) -> AddressClass {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => match embedded_ipv4(v6) {
            Some(v4) => classify_v4(v4),
            None => classify_v6(v6),
        },
    }
}

/// IPv4 address carried inside an IPv6 one: mapped `::ffff:a.b.c.d`,
/// compatible `::a.b.c.d`, NAT64 `64:ff9b::a.b.c.d` and 6to4
/// `2002:aabb:ccdd::`. `::` and `::1` are left alone.
pub fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let segments = ip.segments();
    let join = |hi: u16, lo: u16| Ipv4Addr::from((u32::from(hi) << 16) | u32::from(lo));
    match segments {
        [0, 0, 0, 0, 0, 0, hi, lo] if !ip.is_unspecified() && !ip.is_loopback() => {
            Some(join(hi, lo))
        }
        [0x64, 0xff9b, 0, 0, 0, 0, hi, lo] => Some(join(hi, lo)),
        [0x2002, hi, lo, ..] => Some(join(hi, lo)),
        _ => None,
    }
}

fn classify_v4(ip: Ipv4Addr) -> AddressClass {
    if ip.is_loopback() {
        AddressClass::Loopback
    } else if ip.is_private() {
        AddressClass::Private
    } else if ip.is_link_local() {
        AddressClass::LinkLocal
    } else if ip.octets()[0] == 0 {
        AddressClass::Unspecified
    } else {
        AddressClass::Public
    }
}

fn classify_v6(ip: Ipv6Addr) -> AddressClass {
    let first = ip.segments()[0];
    if ip.is_loopback() {
        AddressClass::Loopback
    } else if ip.is_unspecified() {
        AddressClass::Unspecified
    } else if first & 0xffc0 == 0xfe80 {
        AddressClass::LinkLocal
    } else if first & 0xfe00 == 0xfc00 {
        AddressClass::UniqueLocal
    } else {
        AddressClass::Public
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveErrorKind {
    NotFound,
    Timeout,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ResolveError {
    pub kind: ResolveErrorKind,
    pub message: String,
}

impl ResolveError {
    pub fn new(kind: ResolveErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Resolver backed by the platform's `getaddrinfo`, bounded by a timeout.
///
/// `getaddrinfo` cannot be interrupted, so each lookup runs on its own thread
/// and a timed-out lookup keeps that thread until the OS gives up. At most
/// `max_in_flight` lookups (shared between clones) may be outstanding; past
/// that, `resolve` fails at once instead of spawning more threads.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    pub timeout: Duration,
    pub max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RESOLVE_TIMEOUT,
            max_in_flight: DEFAULT_MAX_LOOKUPS_IN_FLIGHT,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SystemResolver {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Lookups whose threads have not finished yet, including abandoned ones.
    pub fn lookups_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn reserve_slot(&self) -> Option<LookupSlot> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_in_flight).then_some(current + 1)
            })
            .ok()
            .map(|_| LookupSlot(Arc::clone(&self.in_flight)))
    }
}

/// Released when the lookup thread ends, answered or not.
struct LookupSlot(Arc<AtomicUsize>);

impl Drop for LookupSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let slot = self.reserve_slot().ok_or_else(|| {
            ResolveError::new(
                ResolveErrorKind::Other,
                format!(
                    "too many DNS lookups in flight (limit {})",
                    self.max_in_flight
                ),
            )
        })?;
        let (sender, receiver) = mpsc::channel();
        let lookup_host = host.to_string();
        // Detached; a late answer is dropped with the channel.
        thread::Builder::new()
            .name("dns-lookup".to_string())
            .spawn(move || {
                let _slot = slot;
                let result = (lookup_host.as_str(), 443)
                    .to_socket_addrs()
                    .map(|addrs| addrs.map(|addr| addr.ip()).collect::<Vec<IpAddr>>());
                let _ = sender.send(result);
            })
            .map_err(|err| {
                ResolveError::new(
                    ResolveErrorKind::Other,
                    format!("could not start DNS lookup: {err}"),
                )
            })?;
        match receiver.recv_timeout(self.timeout) {
            Ok(Ok(addrs)) => Ok(addrs),
            Ok(Err(err)) => Err(classify_lookup_error(&err)),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ResolveError::new(
                ResolveErrorKind::Timeout,
                format!("DNS lookup timed out after {}s", self.timeout.as_secs_f64()),
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ResolveError::new(
                ResolveErrorKind::Other,
                "DNS lookup thread exited without an answer",
            )),
        }
    }
}

fn classify_lookup_error(err: &io::Error) -> ResolveError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    let not_found = [
        "not known",
        "no such host",
        "nodename nor servname",
        "no address associated",
    ]
    .iter()
    .any(|needle| lowered.contains(needle));
    let kind = if not_found {
        ResolveErrorKind::NotFound
    } else if err.kind() == io::ErrorKind::TimedOut {
        ResolveErrorKind::Timeout
    } else {
        ResolveErrorKind::Other
    };
    ResolveError::new(kind, message)
}

/// Screens caller-supplied image references before anything is fetched or
/// embedded in a request.
///
/// Remote URLs must be `https`, must not name a blocklisted host and must
/// not point at a loopback, private, link-local or unique-local address,
/// either literally or through DNS. Every call resolves again; nothing is
/// cached between calls.
#[derive(Debug, Clone, Default)]
pub struct OriginValidator<R: Resolver = SystemResolver> {
    resolver: R,
}

impl OriginValidator<SystemResolver> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: Resolver> OriginValidator<R> {
    pub fn with_resolver(resolver: R) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn validate_remote_origin(&self, raw: &str) -> OriginClassification {
        let url = match Url::parse(raw.trim()) {
            Ok(url) => url,
            Err(err) => {
                return OriginClassification::rejected(
                    RejectionReason::MalformedUrl,
                    format!("Invalid URL: {err}"),
                )
            }
        };
        if url.scheme() != "https" {
            return OriginClassification::rejected(
                RejectionReason::NotHttps,
                format!("Only HTTPS URLs are allowed (got {}://)", url.scheme()),
            );
        }
        let Some(raw_host) = url.host_str() else {
            return OriginClassification::rejected(
                RejectionReason::MalformedUrl,
                "URL has no host",
            );
        };
        let host = normalize_host(raw_host);
        if host.is_empty() {
            return OriginClassification::rejected(
                RejectionReason::MalformedUrl,
                "URL has no host",
            );
        }

        if let Some(rejection) = blocklisted_host(&host) {
            return OriginClassification::Rejected(rejection);
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return classify_literal(ip);
        }

        self.check_resolution(&host)
    }

    /// Existence and magic-byte check for a local image file.
    pub fn validate_local_path(&self, path: &Path) -> OriginClassification {
        validate_local_path(path)
    }

    fn check_resolution(&self, host: &str) -> OriginClassification {
        let addrs = match self.resolver.resolve(host) {
            Ok(addrs) => addrs,
            Err(err) if err.kind == ResolveErrorKind::NotFound => {
                return OriginClassification::rejected(
                    RejectionReason::ResolutionFailed,
                    format!("Domain {host} could not be resolved"),
                )
            }
            Err(err) => {
                return OriginClassification::rejected(
                    RejectionReason::ResolutionFailed,
                    format!("Failed to validate domain {host}: {err}"),
                )
            }
        };
        if addrs.is_empty() {
            return OriginClassification::rejected(
                RejectionReason::ResolutionFailed,
                format!("Domain {host} could not be resolved"),
            );
        }
        for ip in addrs {
            if !classify_ip(ip).is_public() {
                return OriginClassification::rejected(
                    RejectionReason::ResolvesToPrivateAddress,
                    format!("Domain {host} resolves to a private/internal IP address ({ip})"),
                );
            }
        }
        OriginClassification::Allowed
    }
}

fn normalize_host(raw: &str) -> String {
    let unbracketed = raw
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(raw);
    unbracketed.trim_end_matches('.').to_ascii_lowercase()
}

fn blocklisted_host(host: &str) -> Option<OriginRejection> {
    if host.contains("localhost") {
        return Some(OriginRejection::new(
            RejectionReason::HostnameBlocklisted,
            "URLs pointing to localhost are not allowed",
        ));
    }
    let blocked = BLOCKED_EXACT_HOSTS.contains(&host)
        || BLOCKED_HOST_FRAGMENTS
            .iter()
            .any(|fragment| host.contains(fragment));
    blocked.then(|| {
        OriginRejection::new(
            RejectionReason::HostnameBlocklisted,
            format!("URLs pointing to cloud metadata host {host} are not allowed"),
        )
    })
}

fn classify_literal(ip: IpAddr) -> OriginClassification {
    let class = classify_ip(ip);
    if class.is_public() {
        return OriginClassification::Allowed;
    }
    let target = if class == AddressClass::Loopback {
        "localhost"
    } else {
        "private or internal IP addresses"
    };
    let embedded = match ip {
        IpAddr::V6(v6) => embedded_ipv4(v6),
        IpAddr::V4(_) => None,
    };
    match embedded {
        Some(v4) => OriginClassification::rejected(
            RejectionReason::Ipv4MappedIpv6Bypass,
            format!("URLs pointing to {target} are not allowed (embedded IPv4 address {ip} -> {v4})"),
        ),
        None => OriginClassification::rejected(
            RejectionReason::LiteralPrivateAddress,
            format!("URLs pointing to {target} are not allowed"),
        ),
    }
}

pub fn validate_local_path(path: &Path) -> OriginClassification {
    let display = path.display();
    let metadata = match path.metadata() {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return OriginClassification::rejected(
                RejectionReason::FileNotFound,
                format!("File not found: {display}"),
            )
        }
        Err(err) => {
            return OriginClassification::rejected(
                RejectionReason::Unreadable,
                format!("Cannot access {display}: {err}"),
            )
        }
    };
    if !metadata.is_file() {
        return OriginClassification::rejected(
            RejectionReason::NotAFile,
            format!("Not a file: {display}"),
        );
    }
    let mut head = Vec::with_capacity(SNIFF_BYTES as usize);
    let read = File::open(path).and_then(|file| file.take(SNIFF_BYTES).read_to_end(&mut head));
    if let Err(err) = read {
        return OriginClassification::rejected(
            RejectionReason::Unreadable,
            format!("Cannot read {display}: {err}"),
        );
    }
    match image::guess_format(&head) {
        Ok(ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP | ImageFormat::Gif) => {
            OriginClassification::Allowed
        }
        _ => OriginClassification::rejected(
            RejectionReason::UnrecognizedImage,
            format!("{display} is not a PNG, JPEG, WebP or GIF image"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::sync::Mutex;

    use super::{
        classify_ip, embedded_ipv4, AddressClass, OriginClassification, OriginValidator,
        RejectionReason, ResolveError, ResolveErrorKind, Resolver, SystemResolver,
    };

    #[derive(Default)]
    struct StubResolver {
        answers: HashMap<String, Result<Vec<IpAddr>, ResolveError>>,
        lookups: Mutex<Vec<String>>,
    }

    impl StubResolver {
        fn answer(mut self, host: &str, ips: &[&str]) -> Self {
            let parsed: Vec<IpAddr> = ips.iter().map(|ip| ip.parse().unwrap()).collect();
            self.answers.insert(host.to_string(), Ok(parsed));
            self
        }

        fn fail(mut self, host: &str, kind: ResolveErrorKind, message: &str) -> Self {
            self.answers
                .insert(host.to_string(), Err(ResolveError::new(kind, message)));
            self
        }

        fn lookups(&self) -> Vec<String> {
            self.lookups.lock().unwrap().clone()
        }
    }

    impl Resolver for StubResolver {
        fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
            self.lookups.lock().unwrap().push(host.to_string());
            self.answers.get(host).cloned().unwrap_or_else(|| {
                Err(ResolveError::new(
                    ResolveErrorKind::NotFound,
                    "getaddrinfo ENOTFOUND",
                ))
            })
        }
    }

    fn reason(classification: &OriginClassification) -> Option<RejectionReason> {
        classification.reason()
    }

    #[test]
    fn plain_http_is_rejected() {
        let validator = OriginValidator::with_resolver(StubResolver::default());
        let verdict = validator.validate_remote_origin("http://example.com/x.jpg");
        assert_eq!(reason(&verdict), Some(RejectionReason::NotHttps));
        assert!(validator.resolver().lookups().is_empty());
    }

    #[test]
    fn malformed_urls_are_rejected() {
        let validator = OriginValidator::with_resolver(StubResolver::default());
        for raw in ["not a url", "https://", "https://[::1/x.jpg"] {
            assert_eq!(
                reason(&validator.validate_remote_origin(raw)),
                Some(RejectionReason::MalformedUrl),
                "{raw}"
            );
        }
    }

    #[test]
    fn loopback_literal_and_localhost_name_are_distinguishable() {
        let validator = OriginValidator::with_resolver(StubResolver::default());
        let literal = validator.validate_remote_origin("https://127.0.0.1/x.jpg");
        let named = validator.validate_remote_origin("https://localhost/x.jpg");
        assert_eq!(reason(&literal), Some(RejectionReason::LiteralPrivateAddress));
        assert_eq!(reason(&named), Some(RejectionReason::HostnameBlocklisted));
        assert!(validator.resolver().lookups().is_empty());
    }

    #[test]
    fn loopback_message_differs_from_private_range_message() {
        let validator = OriginValidator::with_resolver(StubResolver::default());
        let loopback = validator.validate_remote_origin("https://127.0.0.1/x.jpg");
        let private = validator.validate_remote_origin("https://10.0.0.1/x.jpg");
        let loopback = loopback.rejection().unwrap().message.clone();
        let private = private.rejection().unwrap().message.clone();
        assert!(loopback.contains("localhost"));
        assert!(private.contains("private or internal"));
        assert_ne!(loopback, private);
    }

    #[test]
    fn private_and_link_local_literals_are_rejected() {
        let validator = OriginValidator::with_resolver(StubResolver::default());
        for raw in [
            "https://10.1.2.3/x.jpg",
            "https://172.16.0.1/x.jpg",
            "https://172.31.255.255/x.jpg",
            "https://192.168.0.10/x.jpg",
            "https://169.254.169.254/latest/meta-data",
            "https://0.0.0.0/x.jpg",
            "https://[::1]/x.jpg",
            "https://[fe80::1]/x.jpg",
            "https://[fd12:3456::1]/x.jpg",
        ] {
            assert_eq!(
                reason(&validator.validate_remote_origin(raw)),
                Some(RejectionReason::LiteralPrivateAddress),
                "{raw}"
            );
        }
        assert!(validator
            .validate_remote_origin("https://172.32.0.1/x.jpg")
            .is_allowed());
    }

    #[test]
    fn ipv4_mapped_ipv6_is_unwrapped_before_classification() {
        let validator = OriginValidator::with_resolver(StubResolver::default());
        for raw in [
            "https://[::ffff:127.0.0.1]/x.jpg",
            "https://[::ffff:10.0.0.1]/x.jpg",
            "https://[::FFFF:127.0.0.1]/x.jpg",
            "https://[::FFFF:10.0.0.1]/x.jpg",
        ] {
            let verdict = validator.validate_remote_origin(raw);
            assert_eq!(
                reason(&verdict),
                Some(RejectionReason::Ipv4MappedIpv6Bypass),
                "{raw}"
            );
        }
        let loopback = validator.validate_remote_origin("https://[::ffff:127.0.0.1]/x.jpg");
        let upper = validator.validate_remote_origin("https://[::FFFF:127.0.0.1]/x.jpg");
        assert_eq!(loopback, upper);
        assert!(loopback.rejection().unwrap().message.contains("localhost"));

        assert!(validator
            .validate_remote_origin("https://[::ffff:8.8.8.8]/x.jpg")
            .is_allowed());
        assert!(validator.resolver().lookups().is_empty());
    }

    #[test]
    fn compatible_nat64_and_6to4_literals_are_unwrapped() {
        let validator = OriginValidator::with_resolver(StubResolver::default());
        for raw in [
            "https://[::127.0.0.1]/x.jpg",
            "https://[::10.0.0.1]/x.jpg",
            "https://[64:ff9b::127.0.0.1]/x.jpg",
            "https://[64:ff9b::192.168.1.1]/x.jpg",
            "https://[2002:a9fe:a9fe::]/x.jpg",
        ] {
            assert_eq!(
                reason(&validator.validate_remote_origin(raw)),
                Some(RejectionReason::Ipv4MappedIpv6Bypass),
                "{raw}"
            );
        }
        assert!(validator
            .validate_remote_origin("https://[64:ff9b::8.8.8.8]/x.jpg")
            .is_allowed());

        let nat64: Ipv6Addr = "64:ff9b::a00:1".parse().unwrap();
        assert_eq!(embedded_ipv4(nat64), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(embedded_ipv4(Ipv6Addr::LOCALHOST), None);
        assert_eq!(embedded_ipv4(Ipv6Addr::UNSPECIFIED), None);
        assert_eq!(embedded_ipv4("2001:db8::1".parse().unwrap()), None);
        assert_eq!(classify_ip("::1".parse().unwrap()), AddressClass::Loopback);
    }

    #[test]
    fn dns_answers_embedding_private_ipv4_are_rejected() {
        let resolver = StubResolver::default().answer("nat64.example.com", &["64:ff9b::7f00:1"]);
        let validator = OriginValidator::with_resolver(resolver);
        assert_eq!(
            reason(&validator.validate_remote_origin("https://nat64.example.com/x.jpg")),
            Some(RejectionReason::ResolvesToPrivateAddress)
        );
    }

    #[test]
    fn system_resolver_refuses_lookups_past_the_in_flight_limit() {
        let resolver = SystemResolver::default().with_max_in_flight(0);
        let err = resolver.resolve("example.com").unwrap_err();
        assert_eq!(err.kind, ResolveErrorKind::Other);
        assert!(err.message.contains("in flight"));
        assert_eq!(resolver.lookups_in_flight(), 0);

        let validator = OriginValidator::with_resolver(resolver);
        assert_eq!(
            reason(&validator.validate_remote_origin("https://example.com/x.jpg")),
            Some(RejectionReason::ResolutionFailed)
        );
    }

    #[test]
    fn metadata_hostnames_are_blocklisted() {
        let validator = OriginValidator::with_resolver(StubResolver::default());
        for raw in [
            "https://metadata.google.internal/computeMetadata/v1/",
            "https://METADATA/x",
            "https://instance-data./latest",
            "https://api.localhost/x.jpg",
        ] {
            assert_eq!(
                reason(&validator.validate_remote_origin(raw)),
                Some(RejectionReason::HostnameBlocklisted),
                "{raw}"
            );
        }
    }

    #[test]
    fn domains_resolving_to_internal_addresses_are_rejected() {
        let internal = [
            "127.0.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "::1",
            "fe80::1",
            "fc00::1",
        ];
        for ip in internal {
            let resolver = StubResolver::default().answer("rebind.example.com", &[ip]);
            let validator = OriginValidator::with_resolver(resolver);
            let verdict = validator.validate_remote_origin("https://rebind.example.com/x.jpg");
            assert_eq!(
                reason(&verdict),
                Some(RejectionReason::ResolvesToPrivateAddress),
                "{ip}"
            );
            let message = &verdict.rejection().unwrap().message;
            assert!(message.contains("resolves to a private/internal IP address"));
            assert!(message.contains(ip));
        }
    }

    #[test]
    fn any_internal_answer_among_many_is_rejected() {
        let resolver =
            StubResolver::default().answer("mixed.example.com", &["93.184.216.34", "10.0.0.7"]);
        let validator = OriginValidator::with_resolver(resolver);
        let verdict = validator.validate_remote_origin("https://mixed.example.com/x.jpg");
        assert_eq!(
            reason(&verdict),
            Some(RejectionReason::ResolvesToPrivateAddress)
        );
    }

    #[test]
    fn resolution_failures_have_distinct_messages() {
        let resolver = StubResolver::default()
            .fail("gone.example.com", ResolveErrorKind::NotFound, "ENOTFOUND")
            .fail("slow.example.com", ResolveErrorKind::Timeout, "ETIMEOUT");
        let validator = OriginValidator::with_resolver(resolver);
        let missing = validator.validate_remote_origin("https://gone.example.com/x.jpg");
        let slow = validator.validate_remote_origin("https://slow.example.com/x.jpg");
        assert_eq!(reason(&missing), Some(RejectionReason::ResolutionFailed));
        assert_eq!(reason(&slow), Some(RejectionReason::ResolutionFailed));

        let missing = &missing.rejection().unwrap().message;
        let slow = &slow.rejection().unwrap().message;
        assert!(missing.contains("could not be resolved"));
        assert!(slow.contains("Failed to validate domain"));
        assert_ne!(missing, slow);
    }

    #[test]
    fn public_domain_is_allowed_and_resolved_every_time() {
        let resolver = StubResolver::default().answer("cdn.example.com", &["8.8.8.8"]);
        let validator = OriginValidator::with_resolver(resolver);
        let url = "https://CDN.example.com./images/x.jpg";
        assert_eq!(
            validator.validate_remote_origin(url),
            OriginClassification::Allowed
        );
        assert!(validator.validate_remote_origin(url).into_result().is_ok());
        assert_eq!(
            validator.resolver().lookups(),
            vec!["cdn.example.com".to_string(), "cdn.example.com".to_string()]
        );
    }

    #[test]
    fn address_classes_cover_reserved_ranges() {
        let cases = [
            ("8.8.8.8", AddressClass::Public),
            ("127.8.9.10", AddressClass::Loopback),
            ("172.20.1.1", AddressClass::Private),
            ("169.254.1.1", AddressClass::LinkLocal),
            ("fe80::abcd", AddressClass::LinkLocal),
            ("febf::1", AddressClass::LinkLocal),
            ("fc00::1", AddressClass::UniqueLocal),
            ("::", AddressClass::Unspecified),
            ("2606:4700::1111", AddressClass::Public),
            ("::ffff:192.168.1.1", AddressClass::Private),
        ];
        for (raw, expected) in cases {
            let ip: IpAddr = raw.parse().unwrap();
            assert_eq!(classify_ip(ip), expected, "{raw}");
        }
    }

    #[test]
    fn local_paths_are_sniffed_for_image_magic() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let png = temp.path().join("input.png");
        fs::write(&png, b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR")?;
        let jpeg = temp.path().join("photo.bin");
        fs::write(&jpeg, [0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'])?;
        let text = temp.path().join("notes.png");
        fs::write(&text, b"definitely not an image")?;

        let validator = OriginValidator::with_resolver(StubResolver::default());
        assert!(validator.validate_local_path(&png).is_allowed());
        assert!(validator.validate_local_path(&jpeg).is_allowed());
        assert_eq!(
            reason(&validator.validate_local_path(&text)),
            Some(RejectionReason::UnrecognizedImage)
        );
        assert_eq!(
            reason(&validator.validate_local_path(&temp.path().join("missing.png"))),
            Some(RejectionReason::FileNotFound)
        );
        assert_eq!(
            reason(&validator.validate_local_path(temp.path())),
            Some(RejectionReason::NotAFile)
        );
        Ok(())
    }
}
