//! Key command - print an entry name

use crate::cache::encode;
use crate::cli::args::KeyArgs;
use crate::error::CacheResult;

/// Execute the key command
pub fn execute(args: KeyArgs) -> CacheResult<()> {
    println!("{}", encode(args.resource, args.version));
    Ok(())
}
