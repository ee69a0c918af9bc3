use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

//LEVEL1_DCACHE_LINESIZE

fn main() {
    println!("cargo:rerun-if-env-changed=LEVEL1_DCACHE_LINESIZE");

    let out_dir = env::var("OUT_DIR").expect("no out directory");
    let dest = Path::new(&out_dir).join("cache_line.rs");

    let mut file = File::create(&dest).expect("could not create file");

    let line_size: usize = option_env!("LEVEL1_DCACHE_LINESIZE")
        .map_or(Ok(128), str::parse)
        .expect("failed to parse env variable LEVEL1_DCACHE_LINESIZE");

    if line_size == 0 || !line_size.is_power_of_two() {
        panic!("invalid LEVEL1_DCACHE_LINESIZE value ({})", line_size);
    }

    write!(
        &mut file,
        "/// The cache line size all per-thread state is padded to.\n\
         #[allow(dead_code)]\n\
         pub(crate) const CACHE_LINE_SIZE: usize = {size};\n\
         \n\
         /// A zero-sized type forcing cache line alignment (and thereby\n\
         /// cache line granular size) on any struct containing it.\n\
         #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]\n\
         #[repr(align({size}))]\n\
         pub(crate) struct CacheLineAlign;\n",
        size = line_size
    )
    .expect("could not write to file");
}
