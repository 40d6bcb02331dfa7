//! TSファイル内のEITのイベント開始時刻をずらして書き出すサンプル。

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};

use dvbsi::eit::EitProcessor;
use dvbsi::{Packet, Pid};

const HELP: &str = "\
EITのイベント開始時刻をずらして書き出す

USAGE:
  eitshift [--offset MILLIS] [--date-only] <input.ts> <output.ts>

FLAGS:
  -h, --help     このヘルプを表示する
  --offset       開始時刻に加えるオフセット（ミリ秒）
  --date-only    日付部分だけを書き換える
";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        print!("{}", HELP);
        std::process::exit(0);
    }

    let offset: i64 = args.opt_value_from_str("--offset")?.unwrap_or(0);
    let date_only = args.contains("--date-only");
    let input: std::path::PathBuf = args.free_from_str()?;
    let output: std::path::PathBuf = args.free_from_str()?;

    env_logger::init();

    let reader = BufReader::with_capacity(188 * 1024, File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);

    let mut processor = EitProcessor::new(Pid::EIT);
    processor.set_start_time_offset(offset, date_only);

    for packet in Packet::iter(reader) {
        let mut packet = packet?;
        processor.process_packet(&mut packet);
        writer.write_all(&packet.0)?;
    }
    writer.flush()?;

    if processor.dropped_count() > 0 {
        eprintln!("dropped sections: {}", processor.dropped_count());
    }

    Ok(())
}
