// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Parses arguments with clap, picks the tensor backend and
// hands off to the application layer. Printing happens here
// and nowhere else.
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use burn::backend::Autodiff;
use clap::Parser;
use commands::{BackendKind, BaseArgs, Commands, InspectArgs, LaunchArgs, PrepareArgs};

use crate::application::{
    inspect_use_case::compare_attention,
    launch::LaunchPlan,
    prepare_use_case::{save_base_checkpoint, PrepareConfig, PrepareUseCase},
};
use crate::ml::lora::LoraConfig;

/// Identity wrapper for backends that do not track gradients.
type Plain<B> = B;

#[derive(Parser, Debug)]
#[command(
    name = "lora-prep",
    version,
    about = "Attach LoRA adapters to a decoder, load base weights and mark adapters trainable."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Run `$body` with `$B` bound to the selected backend and `$device` to its
/// default device. `$wrap` is applied to the backend type, e.g. to run on
/// `Autodiff<_>` when gradients are needed.
macro_rules! with_backend {
    ($kind:expr, |$B:ident, $device:ident| $body:expr) => {
        with_backend!($kind, Plain, |$B, $device| $body)
    };
    ($kind:expr, $wrap:ident, |$B:ident, $device:ident| $body:expr) => {
        match $kind {
            BackendKind::Ndarray => {
                type $B = $wrap<burn::backend::NdArray>;
                let $device = burn::backend::ndarray::NdArrayDevice::default();
                $body
            }
            #[cfg(feature = "wgpu")]
            BackendKind::Wgpu => {
                type $B = $wrap<burn::backend::Wgpu>;
                let $device = burn::backend::wgpu::WgpuDevice::default();
                tracing::info!("Using WGPU device: {:?}", $device);
                $body
            }
            #[cfg(not(feature = "wgpu"))]
            BackendKind::Wgpu => {
                anyhow::bail!("this build has no WGPU support; rebuild with --features wgpu")
            }
        }
    };
}

impl Cli {
    /// Dispatch the subcommand. The CLI layer only routes and prints.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Inspect(args) => run_inspect(args),
            Commands::Base(args)    => run_base(args),
            Commands::Prepare(args) => run_prepare(args),
            Commands::Launch(args)  => run_launch(args),
        }
    }
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let lora = LoraConfig::from(&args.lora);
    let cmp = with_backend!(args.model.backend, |B, device| {
        compare_attention::<B>(args.model.size, &lora, args.layer, &device)?
    });

    println!("Base model, layer {} attention:\n{}\n", args.layer, cmp.base);
    println!("LoRA model, layer {} attention:\n{}\n", args.layer, cmp.lora);
    println!("{} adapter parameters in the LoRA model.", cmp.adapter_params);
    Ok(())
}

fn run_base(args: BaseArgs) -> Result<()> {
    let path = with_backend!(args.model.backend, |B, device| {
        save_base_checkpoint::<B>(args.model.size, &args.out_dir, &device)?
    });
    println!("Base checkpoint saved to {}", path.display());
    Ok(())
}

fn run_prepare(args: PrepareArgs) -> Result<()> {
    let backend = args.model.backend;
    let config: PrepareConfig = args.into();
    let use_case = PrepareUseCase::new(config);

    // require_grad only survives on an autodiff backend
    let report = with_backend!(backend, Autodiff, |B, device| {
        use_case.execute::<B>(&device)?.report
    });
    println!("\n{report}");
    Ok(())
}

fn run_launch(args: LaunchArgs) -> Result<()> {
    let plan: LaunchPlan = args.into();
    plan.validate()?;
    println!("Run the fine-tune with:\n\n  {plan}\n");
    Ok(())
}
