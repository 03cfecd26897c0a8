//! Interfaces the hosting request pipeline exposes to the limiter.

/// Route scope that keeps counters of independently configured limiters apart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Scope {
    /// Route the limiter is attached to
    pub route_id: String,
    /// Service the limiter is attached to
    pub service_id: String,
}

impl Scope {
    /// Create a new scope.
    pub fn new(route_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            service_id: service_id.into(),
        }
    }
}

/// Read access to the request being evaluated.
pub trait RequestContext {
    /// Value of a request header, if present.
    fn header(&self, name: &str) -> Option<String>;

    /// Request path, if known.
    fn path(&self) -> Option<String>;

    /// Network address of the caller, if the host can supply one.
    fn client_address(&self) -> Option<String>;

    /// Route scope of the limiter instance handling this request.
    fn scope(&self) -> Scope {
        Scope::default()
    }
}

/// Response control offered by the hosting pipeline.
pub trait ResponseControl {
    /// Answer the client immediately without forwarding the request.
    fn send_early_response(&mut self, status: u16, headers: Vec<(String, String)>, body: &[u8]);

    /// Let the request continue down the pipeline.
    fn continue_pipeline(&mut self);

    /// Current response headers.
    fn response_headers(&self) -> Vec<(String, String)>;

    /// Replace the response headers.
    fn replace_response_headers(&mut self, headers: Vec<(String, String)>);
}
