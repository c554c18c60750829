use std::{process, sync::Arc, thread};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use rand::Rng;

use extent_fs::{
    config::CacheConfig,
    device::BlockFile,
    error::{Result, VolumeError},
    fs::{Volume, DOUBLE_INDIRECT_BOUND, SECTOR_SIZE},
    logging,
};

/// 默认镜像大小: 0x4000 个扇区 (8 MiB)
const DEFAULT_SECTORS: &str = "16384";

fn main() {
    logging::init();
    match run(&cli().get_matches()) {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(err) => {
            eprintln!("extent-fs: {}", err);
            process::exit(1);
        }
    }
}

fn cli() -> Command {
    let image = Arg::new("image")
        .short('i')
        .long("image")
        .required(true)
        .help("Path of the disk image");
    Command::new("extent-fs")
        .about("Formats, inspects and stress-tests extent-tree volume images")
        .subcommand_required(true)
        .arg(
            Arg::new("cache-slots")
                .long("cache-slots")
                .global(true)
                .value_parser(value_parser!(u32).range(1..))
                .help("Number of sector cache slots [default: 64]"),
        )
        .arg(
            Arg::new("no-read-ahead")
                .long("no-read-ahead")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Do not start the read-ahead thread"),
        )
        .subcommand(
            Command::new("format")
                .about("Create (or overwrite) an image and format it")
                .arg(image.clone())
                .arg(
                    Arg::new("sectors")
                        .short('n')
                        .long("sectors")
                        .value_parser(value_parser!(usize))
                        .default_value(DEFAULT_SECTORS)
                        .help("Image size in 512-byte sectors"),
                ),
        )
        .subcommand(
            Command::new("info")
                .about("Mount an image and print its super block and free space")
                .arg(image.clone()),
        )
        .subcommand(
            Command::new("stress")
                .about("Grow, verify and remove random files from several threads")
                .arg(image)
                .arg(
                    Arg::new("files")
                        .long("files")
                        .value_parser(value_parser!(usize))
                        .default_value("16"),
                )
                .arg(
                    Arg::new("max-len")
                        .long("max-len")
                        .value_parser(value_parser!(usize))
                        .default_value("65536")
                        .help("Upper bound of a file's length in bytes"),
                )
                .arg(
                    Arg::new("threads")
                        .long("threads")
                        .value_parser(value_parser!(u32).range(1..))
                        .default_value("4"),
                ),
        )
}

fn cache_config(matches: &ArgMatches) -> CacheConfig {
    let mut config = CacheConfig::default();
    if let Some(slots) = matches.get_one::<u32>("cache-slots") {
        config = config.with_slots(*slots as usize);
    }
    config.with_read_ahead(!matches.get_flag("no-read-ahead"))
}

/// 返回 false 表示 stress 检查失败
fn run(matches: &ArgMatches) -> Result<bool> {
    let config = cache_config(matches);
    let Some((name, sub)) = matches.subcommand() else {
        return Ok(true);
    };
    // 以 get_one 取出的参数都有默认值或是 required, 因此总是存在
    let image = sub.get_one::<String>("image").cloned().unwrap_or_default();
    match name {
        "format" => {
            let sectors = sub.get_one::<usize>("sectors").copied().unwrap_or(0);
            let device = Arc::new(BlockFile::create(&image, sectors)?);
            let volume = Volume::format(device, &config)?;
            println!(
                "formatted {}: {} sectors, {} free",
                image,
                volume.total_sectors(),
                volume.free_sectors()
            );
            volume.shutdown();
            Ok(true)
        }
        "info" => {
            let volume = Volume::mount(Arc::new(BlockFile::open(&image)?), &config)?;
            println!("image:         {}", image);
            println!("total sectors: {}", volume.total_sectors());
            println!("free sectors:  {}", volume.free_sectors());
            println!("cache slots:   {}", volume.cache().capacity());
            volume.shutdown();
            Ok(true)
        }
        "stress" => {
            let files = sub.get_one::<usize>("files").copied().unwrap_or(1);
            let max_len = sub
                .get_one::<usize>("max-len")
                .copied()
                .unwrap_or(0)
                .min(DOUBLE_INDIRECT_BOUND * SECTOR_SIZE);
            let threads = sub.get_one::<u32>("threads").copied().unwrap_or(1) as usize;
            let volume = Volume::mount(Arc::new(BlockFile::open(&image)?), &config)?;
            let passed = stress(&volume, files, max_len, threads)?;
            println!("cache stats: {:?}", volume.stats());
            volume.shutdown();
            Ok(passed)
        }
        _ => Ok(true),
    }
}

/// 每个线程负责一部分文件: 分块追加随机数字, 读回校验. 最后删除所有文件, 空闲扇区数应当复原
fn stress(volume: &Volume, files: usize, max_len: usize, threads: usize) -> Result<bool> {
    let free_before = volume.free_sectors();
    let mut inumbers = Vec::new();
    for _ in 0..files {
        match volume.create_file(0) {
            Some(inumber) => inumbers.push(inumber),
            None => {
                eprintln!("no space for another file after {}", inumbers.len());
                break;
            }
        }
    }
    if inumbers.is_empty() && files > 0 {
        return Err(VolumeError::NoSpace);
    }

    let failures: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let mine: Vec<usize> = inumbers.iter().copied().skip(t).step_by(threads).collect();
                scope.spawn(move || {
                    mine.into_iter()
                        .filter(|inumber| !check_file(volume, *inumber, max_len))
                        .count()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(1))
            .sum()
    });

    for inumber in inumbers.iter() {
        volume.remove_file(*inumber);
    }
    let free_after = volume.free_sectors();
    println!(
        "stress: {} file(s), {} failure(s), free sectors {} -> {}",
        inumbers.len(),
        failures,
        free_before,
        free_after
    );
    Ok(failures == 0 && free_before == free_after)
}

fn check_file(volume: &Volume, inumber: usize, max_len: usize) -> bool {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=max_len);
    let content: Vec<u8> = (0..len).map(|_| b'0' + rng.gen_range(0..10u8)).collect();

    let inode = volume.inodes().open(inumber);
    let mut offset = 0;
    while offset < len {
        let chunk = rng.gen_range(1..=SECTOR_SIZE * 3).min(len - offset);
        let written = inode.write_at(&content[offset..offset + chunk], offset);
        if written == 0 {
            break;
        }
        offset += written;
    }
    let mut back = vec![0u8; offset];
    let read = inode.read_at(&mut back, 0);
    volume.inodes().close(inode);

    let ok = read == offset && back[..] == content[..offset];
    if offset < len {
        info!("inode {}: disk full after {} of {} bytes", inumber, offset, len);
    }
    if !ok {
        eprintln!("inode {}: read back mismatch", inumber);
    }
    ok
}
