//! Run command: tone-map one image.

use crate::RunArgs;
use anyhow::Result;
use hdr_compute::{
    Method, Operator, Params, Reporter, RunOptions, Session, StageMask, ToneMapper,
    VerificationStatus,
};
use hdr_core::Image;
use tracing::{debug, info};

/// Runs the selected operator and writes the result.
pub fn run(args: RunArgs, verbose: bool) -> Result<()> {
    let input = super::load_image(&args.image)?;
    let mut output = Image::new(input.width(), input.height())?;
    let operator = Operator::new(args.filter);
    info!(filter = %args.filter, method = %args.method, size = %input.size(), "tone mapping");

    println!("--------------------------------Tonemapping using {}", args.filter);

    match args.method {
        Method::Reference => {
            let mut mapper = ToneMapper::with_reporter(operator, Reporter::new(super::status_sink()));
            mapper.reference(input.as_bytes(), output.as_bytes_mut(), input.size())?;
        }
        Method::Gpu => {
            let mask = match &args.kernels {
                Some(list) => StageMask::parse(list, args.filter.stage_count())?,
                None => StageMask::all(),
            };
            if verbose {
                println!("Stages: {}", args.filter.stage_names().join(", "));
            }

            let mut params = Params::default().with_class(args.class);
            if let Some(selection) = args.device {
                params = params.with_device(selection);
            }
            params.compute_units = args.compute_units;
            debug!(?params, "device parameters");

            let mut session = Session::new(operator, params, super::status_sink());
            session.init(input.width(), input.height())?;
            let options = RunOptions {
                mask,
                recompute_mapping: args.remap,
                verify: args.verify,
            };
            let report = session.process(input.as_bytes(), output.as_bytes_mut(), &options)?;
            session.shutdown();

            if let VerificationStatus::Failed(details) = report.verification {
                println!("{details}");
            }
        }
    }

    let path = args
        .output
        .unwrap_or_else(|| super::default_output(&args.image, args.filter));
    super::save_image(&path, &output)?;
    println!("Wrote {}", path.display());
    Ok(())
}
