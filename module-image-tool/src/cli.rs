// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    anyhow::{anyhow, Context, Result},
    clap::{Arg, ArgMatches, Command},
    log::{info, warn, LevelFilter},
    module_image::{BuildOptions, Endian, ImageBuilder, ModuleImage},
    std::{
        collections::{BTreeMap, BTreeSet},
        path::{Component, Path, PathBuf},
    },
};

const ABOUT: &str = "\
# About

`mimage` inspects and produces module images.

A module image packs many named resources into a single file. Every
resource can be located by its name in constant time through an index
stored at the front of the file.

Resource names have the form `/<module>/<path>`.
";

const PACK_ABOUT: &str = "\
Build a module image from a directory tree.

Every file under the input directory becomes a resource. The first path
component of a file relative to the input directory is used as its module.
e.g. `java.base/java/lang/Object.class` is stored as
`/java.base/java/lang/Object.class`.

Files directly inside the input directory are stored without a module.
";

fn image_arg() -> Arg<'static> {
    Arg::new("image")
        .required(true)
        .takes_value(true)
        .help("Path to module image to read")
}

pub fn run() -> Result<()> {
    let app = Command::new("Module Image Tool")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Inspect and produce module images")
        .long_about(ABOUT)
        .arg_required_else_help(true);

    let app = app
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        )
        .arg(
            Arg::new("big_endian")
                .long("big-endian")
                .global(true)
                .conflicts_with("little_endian")
                .help("Module image integers are big-endian"),
        )
        .arg(
            Arg::new("little_endian")
                .long("little-endian")
                .global(true)
                .help("Module image integers are little-endian"),
        );

    let app = app.subcommand(
        Command::new("info")
            .about("Print header fields and region sizes of a module image")
            .arg(image_arg()),
    );

    let app = app.subcommand(
        Command::new("list")
            .about("Print the names of resources in a module image")
            .arg(image_arg())
            .arg(
                Arg::new("module")
                    .long("module")
                    .takes_value(true)
                    .help("Only print resources belonging to this module"),
            ),
    );

    let app = app.subcommand(
        Command::new("extract")
            .about("Write the stored bytes of a single resource")
            .arg(image_arg())
            .arg(
                Arg::new("name")
                    .required(true)
                    .takes_value(true)
                    .help("Full name of resource to extract"),
            )
            .arg(
                Arg::new("output")
                    .long("output")
                    .short('o')
                    .takes_value(true)
                    .help("File to write to. Defaults to stdout"),
            ),
    );

    let app = app.subcommand(
        Command::new("extract-all")
            .about("Write every resource of a module image to a directory")
            .arg(image_arg())
            .arg(
                Arg::new("dest_dir")
                    .required(true)
                    .takes_value(true)
                    .help("Directory to write resources to"),
            ),
    );

    let app = app.subcommand(
        Command::new("pack")
            .about("Build a module image from a directory tree")
            .long_about(PACK_ABOUT)
            .arg(
                Arg::new("source_dir")
                    .required(true)
                    .takes_value(true)
                    .help("Directory holding resources"),
            )
            .arg(
                Arg::new("image")
                    .required(true)
                    .takes_value(true)
                    .help("Path of module image to write"),
            )
            .arg(
                Arg::new("density")
                    .long("density")
                    .takes_value(true)
                    .default_value("1.0")
                    .help("Ratio of index buckets to resources"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Check that every resource is reachable and in bounds")
            .arg(image_arg()),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    let (command, args) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("invalid sub-command"))?;

    match command {
        "extract" => command_extract(args),
        "extract-all" => command_extract_all(args),
        "info" => command_info(args),
        "list" => command_list(args),
        "pack" => command_pack(args),
        "verify" => command_verify(args),
        _ => Err(anyhow!("unhandled sub-command: {}", command)),
    }
}

fn required_value<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.value_of(name)
        .ok_or_else(|| anyhow!("{} argument is required", name))
}

fn byte_order(args: &ArgMatches) -> Endian {
    if args.is_present("big_endian") {
        Endian::Big
    } else if args.is_present("little_endian") {
        Endian::Little
    } else {
        scroll::NATIVE
    }
}

fn open_image(args: &ArgMatches) -> Result<ModuleImage> {
    let path = required_value(args, "image")?;

    ModuleImage::open_with_endian(path, byte_order(args))
        .with_context(|| format!("opening module image {}", path))
}

fn command_info(args: &ArgMatches) -> Result<()> {
    let image = open_image(args)?;
    let header = image.header();

    println!("version: {}.{}", header.major_version, header.minor_version);
    println!("byte order: {:?}", image.endian());
    println!("resources: {}", header.resource_count);
    println!("index buckets: {}", header.location_count);
    println!("index tables size: {}", header.table_size());
    println!("location records size: {}", header.locations_size);
    println!("string pool size: {}", header.strings_size);
    println!("index size: {}", header.index_size());
    println!("content size: {}", image.file_len() - header.index_size());
    println!("modules: {}", image.module_names()?.join(", "));

    Ok(())
}

fn command_list(args: &ArgMatches) -> Result<()> {
    let image = open_image(args)?;
    let module = args.value_of("module");

    for location in image.locations() {
        let location = location?;

        if module.map_or(true, |m| m == location.module()) {
            println!("{}", location.full_name());
        }
    }

    Ok(())
}

fn command_extract(args: &ArgMatches) -> Result<()> {
    let image = open_image(args)?;
    let name = required_value(args, "name")?;

    let location = image
        .find(name)?
        .ok_or_else(|| anyhow!("resource not found: {}", name))?;

    if location.is_compressed() {
        warn!("{} is compressed; writing stored bytes", name);
    }

    let data = image.read(&location)?;

    if let Some(output) = args.value_of("output") {
        std::fs::write(output, &data).with_context(|| format!("writing {}", output))?;
        info!("wrote {} bytes to {}", data.len(), output);
    } else {
        use std::io::Write;
        std::io::stdout().write_all(&data)?;
    }

    Ok(())
}

/// Resolve the filesystem path a resource is extracted to.
fn extract_path(dest_dir: &Path, name: &str) -> Result<PathBuf> {
    let relative = name.trim_start_matches('/');

    // Path normalization would otherwise hide these.
    if relative.is_empty() || relative.ends_with('/') || relative.contains("//") {
        return Err(anyhow!("resource {} has no usable file name", name));
    }

    let relative = Path::new(relative);

    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(anyhow!("refusing to extract resource {}", name));
    }

    Ok(dest_dir.join(relative))
}

/// Resolve the paths resources are extracted to.
///
/// Fails if any two resources would claim the same path or if a resource
/// would need to be both a file and a directory.
fn extract_paths<'a>(
    dest_dir: &Path,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<PathBuf>> {
    let paths = names
        .into_iter()
        .map(|name| extract_path(dest_dir, name))
        .collect::<Result<Vec<_>>>()?;

    let mut seen = BTreeSet::new();
    for path in &paths {
        if !seen.insert(path.as_path()) {
            return Err(anyhow!("multiple resources extract to {}", path.display()));
        }
    }

    for path in &paths {
        if let Some(file) = path
            .ancestors()
            .skip(1)
            .find(|ancestor| seen.contains(ancestor))
        {
            return Err(anyhow!(
                "{} is both a resource and a directory of {}",
                file.display(),
                path.display()
            ));
        }
    }

    Ok(paths)
}

fn command_extract_all(args: &ArgMatches) -> Result<()> {
    let image = open_image(args)?;
    let dest_dir = PathBuf::from(required_value(args, "dest_dir")?);

    let locations = image.locations().collect::<Result<Vec<_>, _>>()?;
    let names = locations
        .iter()
        .map(|location| location.full_name())
        .collect::<Vec<_>>();
    let paths = extract_paths(&dest_dir, names.iter().map(String::as_str))?;

    let mut count = 0;

    for (location, dest_path) in locations.iter().zip(paths) {
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&dest_path, image.read(location)?)
            .with_context(|| format!("writing {}", dest_path.display()))?;
        count += 1;
    }

    info!("extracted {} resources to {}", count, dest_dir.display());

    Ok(())
}

/// Derive the resource name of a file relative to the packed directory.
fn resource_name(relative: &Path) -> Result<String> {
    let components = relative
        .components()
        .map(|c| match c {
            Component::Normal(s) => s
                .to_str()
                .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", relative.display())),
            _ => Err(anyhow!("unexpected path component in {}", relative.display())),
        })
        .collect::<Result<Vec<_>>>()?;

    match components.as_slice() {
        [] => Err(anyhow!("empty resource path")),
        [file] => Ok(file.to_string()),
        [module, rest @ ..] => Ok(format!("/{}/{}", module, rest.join("/"))),
    }
}

/// Find every file under a directory, keyed by resource name.
fn collect_resources(source_dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut resources = BTreeMap::new();

    for entry in walkdir::WalkDir::new(source_dir).sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;

        if entry.file_type().is_dir() {
            continue;
        }

        let relative = entry.path().strip_prefix(source_dir)?;
        resources.insert(resource_name(relative)?, entry.path().to_path_buf());
    }

    Ok(resources)
}

fn command_pack(args: &ArgMatches) -> Result<()> {
    let source_dir = PathBuf::from(required_value(args, "source_dir")?);
    let image_path = required_value(args, "image")?;
    let density = args.value_of_t::<f64>("density")?;

    let mut builder = ImageBuilder::new(BuildOptions {
        byte_order: byte_order(args),
        bucket_density: density,
        ..Default::default()
    });

    for (name, path) in collect_resources(&source_dir)? {
        let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        builder.add_resource(name, data)?;
    }

    let mut fh = std::io::BufWriter::new(
        std::fs::File::create(image_path).with_context(|| format!("creating {}", image_path))?,
    );
    let size = builder.write_to(&mut fh)?;
    std::io::Write::flush(&mut fh)?;

    info!(
        "packed {} resources into {} ({} bytes)",
        builder.len(),
        image_path,
        size
    );

    Ok(())
}

fn command_verify(args: &ArgMatches) -> Result<()> {
    let image = open_image(args)?;
    let count = image.verify()?;

    println!("verified {} resources", count);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names() -> Result<()> {
        assert_eq!(
            resource_name(Path::new("java.base/java/lang/Object.class"))?,
            "/java.base/java/lang/Object.class"
        );
        assert_eq!(resource_name(Path::new("m/a.txt"))?, "/m/a.txt");
        assert_eq!(resource_name(Path::new("top.txt"))?, "top.txt");
        assert!(resource_name(Path::new("")).is_err());
        assert!(resource_name(Path::new("../x")).is_err());

        Ok(())
    }

    #[test]
    fn extract_path_names() -> Result<()> {
        let dest = Path::new("out");

        assert_eq!(
            extract_path(dest, "/m/p/a.txt")?,
            PathBuf::from("out/m/p/a.txt")
        );
        assert_eq!(extract_path(dest, "top.txt")?, PathBuf::from("out/top.txt"));
        assert!(extract_path(dest, "/m/../../etc/passwd").is_err());
        assert!(extract_path(dest, "/m/").is_err());
        assert!(extract_path(dest, "dir/").is_err());
        assert!(extract_path(dest, "a//b").is_err());

        Ok(())
    }

    #[test]
    fn extract_path_conflicts() -> Result<()> {
        let dest = Path::new("out");

        assert_eq!(
            extract_paths(dest, ["/m/a.txt", "/m/p/b.txt", "top.txt"])?,
            vec![
                PathBuf::from("out/m/a.txt"),
                PathBuf::from("out/m/p/b.txt"),
                PathBuf::from("out/top.txt"),
            ]
        );
        assert!(extract_paths(dest, ["dir/", "dir/x"]).is_err());
        assert!(extract_paths(dest, ["/m/", "/m/a"]).is_err());
        assert!(extract_paths(dest, ["/m/p", "/m/p/x.txt"]).is_err());
        assert!(extract_paths(dest, ["/m/a.txt", "m/a.txt"]).is_err());

        Ok(())
    }

    #[test]
    fn extract_all_writes_nothing_on_conflict() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let dest = temp_dir.path().join("out");

        let mut builder = ImageBuilder::default();
        builder.add_resource("/m/p", b"file".to_vec())?;
        builder.add_resource("/m/p/x.txt", b"nested".to_vec())?;
        let image = ModuleImage::from_bytes(builder.to_bytes()?)?;

        let names = image.entry_names()?;
        assert!(extract_paths(&dest, names.iter().map(String::as_str)).is_err());
        assert!(!dest.exists());

        Ok(())
    }

    #[test]
    fn pack_directory() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let source = temp_dir.path().join("source");

        std::fs::create_dir_all(source.join("java.base/java/lang"))?;
        std::fs::write(source.join("java.base/java/lang/Object.class"), b"object")?;
        std::fs::create_dir_all(source.join("other"))?;
        std::fs::write(source.join("other/data.bin"), b"data")?;
        std::fs::write(source.join("README"), b"readme")?;

        let resources = collect_resources(&source)?;
        assert_eq!(
            resources.keys().collect::<Vec<_>>(),
            vec![
                "/java.base/java/lang/Object.class",
                "/other/data.bin",
                "README"
            ]
        );

        let mut builder = ImageBuilder::default();
        for (name, path) in resources {
            builder.add_resource(name, std::fs::read(path)?)?;
        }

        let image = ModuleImage::from_bytes(builder.to_bytes()?)?;
        assert_eq!(
            image.read_by_name("/java.base/java/lang/Object.class")?,
            b"object"
        );
        assert_eq!(image.module_names()?, vec!["java.base", "other"]);
        assert_eq!(image.verify()?, 3);

        Ok(())
    }
}
