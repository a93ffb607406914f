//! Control-plane requests addressed to endpoint virtual hosts.
//!
//! The endpoint routes these by `Host` alone; the names are never resolved.

use http::header::HOST;
use http::{HeaderValue, Method, Request, StatusCode, Uri};

use super::body::{TunnelBody, empty_body};
use super::error::ControlError;
use super::transport::RoundTrip;

/// Liveness probe (`HEAD`).
pub const LIVENESS_HOST: &str = "i:80";
/// Capability info (`GET`, JSON).
pub const INFO_HOST: &str = "i:81";
/// PAC template (`GET`).
pub const PAC_HOST: &str = "i:82";
/// PAC template, asking the endpoint to rebuild it first (`GET`).
pub const PAC_UPDATE_HOST: &str = "i:83";

pub fn control_request(method: Method, host: &'static str) -> Request<TunnelBody> {
    let mut req = Request::new(empty_body());
    *req.method_mut() = method;
    *req.uri_mut() = Uri::from_static("/");
    req.headers_mut()
        .insert(HOST, HeaderValue::from_static(host));
    req
}

pub fn liveness_request() -> Request<TunnelBody> {
    control_request(Method::HEAD, LIVENESS_HOST)
}

/// Issue a control request and return the body of a 200 response.
pub async fn fetch<R>(rt: &R, method: Method, host: &'static str) -> Result<Vec<u8>, ControlError>
where
    R: RoundTrip + ?Sized,
{
    let resp = rt.round_trip(control_request(method, host)).await?;
    if resp.status != StatusCode::OK {
        return Err(ControlError::Status {
            host,
            status: resp.status.as_u16(),
        });
    }
    Ok(resp.into_bytes().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_probe_targets_virtual_host() {
        let req = liveness_request();
        assert_eq!(req.method(), Method::HEAD);
        assert_eq!(req.headers()[HOST], "i:80");
        assert_eq!(req.uri().path(), "/");
    }
}
