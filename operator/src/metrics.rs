use hyper::{
    Body, Request, Response, Server,
    service::{make_service_fn, service_fn},
};
use prometheus::{Encoder, TextEncoder};
use std::{convert::Infallible, net::SocketAddr};

async fn serve_metrics(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        eprintln!("failed to encode metrics: {err}");
        return Ok(Response::builder()
            .status(500)
            .body(Body::empty())
            .unwrap());
    }
    Ok(Response::builder()
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap())
}

/// Serves the default prometheus registry on `0.0.0.0:<port>`.
pub async fn run_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(serve_metrics)) });
    println!("serving metrics on :{port}");
    if let Err(err) = Server::bind(&addr).serve(make_svc).await {
        eprintln!("metrics server error: {err}");
    }
}
