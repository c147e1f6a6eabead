pub async fn run(config_path: &std::path::Path) -> eyre::Result<()> {
    let config = quic_tunnel::config::ServerConfig::load(config_path).await?;
    super::init_tracing(&config.log_level);

    let tls = quic_tunnel_net::tls::server_config_from_pem(&config.cert, &config.key)?;
    let addr = std::net::SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, config.listen));
    let pump = quic_tunnel::server::listen(addr, tls)?;

    quic_tunnel::server::serve(pump, super::shutdown_on_ctrl_c()).await;
    Ok(())
}
