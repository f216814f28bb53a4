use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use song_cache::cache::{EvictionManager, SongDb};
use song_cache::config::Config;
use song_cache::storage::JsonStorage;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("song_cache=debug".parse()?),
        )
        .init();

    info!("🎵 Iniciando Song Cache v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    // Abrir base de datos de canciones
    let db = Arc::new(SongDb::open(config.song_db_path.clone()).await?);
    let drift = db.verify_total_size();
    if drift != 0 {
        info!("⚖️ Tamaño total reconciliado al iniciar ({} bytes)", drift);
    }
    db.spawn_maintenance(config.flush_interval(), config.consistency_check_interval());

    let eviction = EvictionManager::new(Arc::clone(&db), config.eviction_config());

    // Aplicar el presupuesto por si se redujo desde la última ejecución
    match eviction.ensure_space(0).await {
        Ok(reservation) if !reservation.report().evicted.is_empty() => {
            let report = reservation.report();
            info!(
                "🧹 {} canciones desalojadas al iniciar ({} bytes)",
                report.evicted.len(),
                report.freed_bytes
            );
        }
        Ok(_) => {}
        Err(e) => error!("❌ No se pudo aplicar el presupuesto de caché: {}", e),
    }

    info!("{}", db.stats());
    info!("🚀 Song Cache iniciado exitosamente");

    // Manejar shutdown graceful
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    db.close().await?;
    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar que el directorio de caché sea escribible
    let marker = config.cache_dir.join(".health-check");
    tokio::fs::write(&marker, b"ok").await?;
    tokio::fs::remove_file(&marker).await?;

    // Verificar que la tabla de canciones se pueda leer
    let storage = JsonStorage::inspect(config.song_db_path.clone());
    let table = storage.load().await?;
    info!("{}", storage.get_storage_stats().await?);

    info!(
        "📂 {} canciones y {} locks en la tabla",
        table.songs.len(),
        table.locks.len()
    );
    println!("OK");
    Ok(())
}
