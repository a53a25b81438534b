use casrv::Catalog;

use crate::cmd::PvsArgs;
use crate::exit::{catalog_error, CliResult, SUCCESS};
use crate::output::{print_pvs, OutputFormat};

pub fn run(args: PvsArgs, format: OutputFormat) -> CliResult<i32> {
    let catalog = Catalog::from_path(&args.pvs).map_err(catalog_error)?;
    print_pvs(&catalog.pvs, format);
    Ok(SUCCESS)
}
