use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use image::DynamicImage;
use sable_core::monitor::{MemoryProbe, NoopProbe};
use sable_core::sd;
use sable_core::{
    DeviceMap, GenerationRequest, Manager, Orchestrator, OutputConfig, Precision, SaveFormat,
};
use serde::Serialize;
use std::{io::Cursor, path::PathBuf, sync::Arc};
use tokio::{self, net::TcpListener};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Sable image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Hub id of the diffusion checkpoint to serve
    #[arg(long, default_value = sd::DEFAULT_MODEL_ID)]
    model: String,

    /// Split the pipeline into stages and keep only the active one on the GPU
    #[arg(long)]
    optimized: bool,

    /// Load weights in full precision instead of half
    #[arg(long)]
    full_precision: bool,

    /// Directory for generated images and grids
    #[arg(long, default_value = "outputs")]
    outdir: PathBuf,

    /// Output encoding, e.g. png, jpg:90 or webp:-100
    #[arg(long, default_value = "png")]
    save_format: String,

    /// Write a YAML metadata sidecar next to every image
    #[arg(long)]
    write_info_files: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

/// Converts an image into a base64-encoded PNG.
fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Serialize)]
struct GenerationResponse {
    images: Vec<String>,
    seed: u32,
    info: String,
    stats: String,
}

// Application state containing the model registry and generation settings.
struct AppState {
    manager: Manager,
    names: sable_core::ModelNames,
    output: OutputConfig,
    device_map: DeviceMap,
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerationRequest>,
) -> impl IntoResponse {
    let result = tokio::task::spawn_blocking(move || generate_images(req, &state)).await;
    match result {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(e)) => {
            tracing::error!("error generating image: {e:?}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e:?}")).into_response()
        }
        Err(e) => {
            tracing::error!("generation task panicked: {e:?}");
            (StatusCode::INTERNAL_SERVER_ERROR, "generation task failed".to_string())
                .into_response()
        }
    }
}

/// Runs one generation against the shared registry and encodes the results.
fn generate_images(params: GenerationRequest, state: &AppState) -> Result<GenerationResponse> {
    let orchestrator = Orchestrator::new(
        &state.manager,
        state.names.clone(),
        state.output.clone(),
        state.device_map,
    )?;
    let mut progress = |step_state: &sable_core::SamplingState<'_>| {
        let percent = 100 * (step_state.step + 1) / step_state.steps.max(1);
        tracing::debug!("step {}/{} ({percent}%)", step_state.step + 1, step_state.steps);
        Ok(sable_core::StepControl::Continue)
    };
    let outcome = orchestrator.generate(&params, &mut progress)?;
    tracing::info!("{}", outcome.info);
    tracing::info!("{}", outcome.stats);
    let images = outcome
        .images
        .iter()
        .map(image_to_base64_png)
        .collect::<Result<Vec<_>>>()?;
    Ok(GenerationResponse { images, seed: outcome.seed, info: outcome.info, stats: outcome.stats })
}

fn build_probe() -> Arc<dyn MemoryProbe> {
    #[cfg(feature = "nvml")]
    {
        match sable_core::monitor::NvmlProbe::new(0) {
            Ok(probe) => return Arc::new(probe),
            Err(e) => tracing::info!("NVML unavailable, memory stats disabled: {e}"),
        }
    }
    Arc::new(NoopProbe)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device_map = if args.cpu { DeviceMap::ForceCpu } else { DeviceMap::default() };
    let precision = if args.full_precision { Precision::Full } else { Precision::Half };

    let mut manager = Manager::new(build_probe(), args.optimized);
    sd::register_sd_models(&mut manager, &args.model, device_map, precision, args.optimized)?;

    let output = OutputConfig {
        outdir: args.outdir.clone(),
        save_format: SaveFormat::parse(&args.save_format)?,
        grid_format: SaveFormat::parse(&args.save_format)?,
        write_info_files: args.write_info_files,
        ..OutputConfig::default()
    };
    let app_state = Arc::new(AppState {
        manager,
        names: sd::model_names(args.optimized, &args.model),
        output,
        device_map,
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(app_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
