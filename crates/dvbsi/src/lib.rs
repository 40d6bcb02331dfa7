//! DVB系のMPEG2-TSからPSI・SIセクションを取り込み、変換して再送出するための
//! クレート。
//!
//! TSパケットからのセクション再組み立て（[`demux::SectionDemux`]）、
//! セクションのパケット化（[`packetizer::Packetizer`]）、複数セクションに
//! またがる論理テーブルの直列化（[`table::TableBuilder`]）、そしてそれらを
//! 束ねてEITを実時間で書き換える[`eit::EitProcessor`]を提供する。

#![deny(missing_docs)]

pub mod buffer;
pub mod crc32;
pub mod demux;
pub mod eit;
pub mod packet;
pub mod packetizer;
pub mod pid;
pub mod psi;
pub mod table;
pub mod time;
mod utils;

pub use packet::Packet;
pub use pid::Pid;
pub use psi::Section;
