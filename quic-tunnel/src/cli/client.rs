use std::sync::Arc;

pub async fn run(config_path: &std::path::Path) -> eyre::Result<()> {
    let config = quic_tunnel::config::ClientConfig::load(config_path).await?;
    super::init_tracing(&config.log_level);
    let credentials = config.credentials()?;

    let manager = quic_tunnel::ConnectionManager::quic(config.skip_cert_verify);
    let proxy = Arc::new(quic_tunnel::proxy::Proxy::new(
        manager,
        config.remote_addr.clone(),
        credentials,
    ));

    let listener =
        tokio::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, config.listen)).await?;
    tracing::info!(
        "HTTP proxy listening on {}, tunnelling through {}",
        listener.local_addr()?,
        config.remote_addr
    );

    quic_tunnel::proxy::run(listener, proxy, super::shutdown_on_ctrl_c()).await;
    Ok(())
}
