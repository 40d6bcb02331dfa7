//! TSパケットからセクションを再組み立てするためのモジュール。

use arrayvec::ArrayVec;

use crate::packet::Packet;
use crate::pid::{Pid, PidTable};
use crate::psi::{Section, SectionError, MAX_PRIVATE_SECTION_SIZE};
use crate::utils::SliceExt;

/// 各PIDでセクションを分離するかどうかを設定するテーブル。
#[derive(Clone)]
pub struct Table(PidTable<Option<PacketState>>);

impl Table {
    /// 何も設定されていない空のテーブルを生成する。
    #[inline]
    pub fn new() -> Table {
        Table(PidTable::from_fn(|_| None))
    }

    /// `pid`のパケットからセクションを分離するよう設定されているかどうかを返す。
    #[inline]
    pub fn is_set(&self, pid: Pid) -> bool {
        self.0[pid].is_some()
    }

    /// `pid`のパケットからセクションを分離するよう設定する。
    #[inline]
    pub fn set(&mut self, pid: Pid) {
        if self.0[pid].is_none() {
            self.0[pid] = Some(PacketState::new());
        }
    }

    /// `pid`のパケットで何も処理しないよう設定を解除する。
    #[inline]
    pub fn unset(&mut self, pid: Pid) {
        self.0[pid] = None;
    }
}

impl Default for Table {
    #[inline]
    fn default() -> Table {
        Table::new()
    }
}

/// セクション分離における状況。
pub struct Context<'a> {
    packet: &'a Packet,
    table: &'a mut Table,
}

impl<'a> Context<'a> {
    /// 分離対象のパケットを返す。
    #[inline]
    pub fn packet(&self) -> &Packet {
        self.packet
    }

    /// 各PIDにおける処理方法を設定するテーブルを返す。
    #[inline]
    pub fn table(&mut self) -> &mut Table {
        self.table
    }
}

/// [`SectionDemux`]に渡すフィルターで、セクションを処理するために各メソッドが
/// 呼ばれる。
pub trait SectionFilter {
    /// フィルター初期化時に呼ばれ、各PIDにおける処理方法を設定するテーブルを返す。
    fn on_setup(&mut self) -> Table;

    /// セクションを分離した際に呼ばれる。
    ///
    /// 渡されるセクションはCRC32の検証を終えている。書き換える場合は複製を
    /// 取ること。
    fn on_section(&mut self, ctx: &mut Context, section: &Section);
}

impl<T: SectionFilter + ?Sized> SectionFilter for &mut T {
    #[inline]
    fn on_setup(&mut self) -> Table {
        (**self).on_setup()
    }

    #[inline]
    fn on_section(&mut self, ctx: &mut Context, section: &Section) {
        (**self).on_section(ctx, section)
    }
}

/// TSパケットの連続した流れからセクションを再組み立てする。
pub struct SectionDemux<F: SectionFilter> {
    filter: F,
    table: Table,
}

impl<F: SectionFilter> SectionDemux<F> {
    /// `SectionDemux`を生成する。
    pub fn new(mut filter: F) -> SectionDemux<F> {
        let table = filter.on_setup();
        SectionDemux { filter, table }
    }

    /// 内包するフィルターを参照で返す。
    #[inline]
    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// 内包するフィルターを可変参照で返す。
    #[inline]
    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }

    /// `SectionDemux`を消費して内包するフィルターを返す。
    #[inline]
    pub fn into_filter(self) -> F {
        self.filter
    }

    /// 各PIDにおける処理方法を設定するテーブルを返す。
    #[inline]
    pub fn table_mut(&mut self) -> &mut Table {
        &mut self.table
    }

    /// `pid`が分離対象かどうかを返す。
    #[inline]
    pub fn is_tracked(&self, pid: Pid) -> bool {
        self.table.is_set(pid)
    }

    /// [`Packet`]を処理してセクションを分離する。
    pub fn feed(&mut self, packet: &Packet) {
        if !packet.is_normal() {
            return;
        }

        let pid = packet.pid();
        let Some(state) = self.table.0[pid].as_mut() else {
            return;
        };

        let cc_ok = packet.validate_cc(&mut state.last_cc);

        // 所有権を切り離すためにパケット処理中はTempを設定
        let mut store = std::mem::replace(&mut state.store, Store::Temp);

        let mut ctx = Context {
            packet,
            table: &mut self.table,
        };
        if let Store::Section(partial) = &mut store {
            if !cc_ok {
                // 不連続を検出したら組み立て中のセクションは破棄する
                partial.buffer.clear();
            }

            match packet.payload() {
                Some(payload) if !payload.is_empty() => {
                    if packet.unit_start_indicator() {
                        let len = payload[0] as usize;
                        if let Some((prev, next)) = payload[1..].split_at_checked(len) {
                            if !prev.is_empty() && cc_ok {
                                partial.write(&mut self.filter, &mut ctx, prev, false);
                            }
                            if !next.is_empty() {
                                partial.write(&mut self.filter, &mut ctx, next, true);
                            }
                        }
                    } else if cc_ok {
                        partial.write(&mut self.filter, &mut ctx, payload, false);
                    }
                }
                _ => {}
            }
        }

        // フィルター内でテーブルの設定がされていなければ値を戻す
        if let Some(
            state @ PacketState {
                store: Store::Temp, ..
            },
        ) = &mut self.table.0[pid]
        {
            state.store = store;
        }
    }
}

#[derive(Clone)]
struct PacketState {
    last_cc: u8,
    store: Store,
}

impl PacketState {
    #[inline]
    fn new() -> PacketState {
        PacketState {
            last_cc: 0x10,
            store: Store::Section(PartialSection {
                buffer: Box::new(ArrayVec::new()),
            }),
        }
    }
}

#[derive(Clone)]
enum Store {
    /// セクション組み立て用。
    Section(PartialSection),
    /// パケット処理中に設定しておく一時的な値。
    Temp,
}

#[derive(Clone)]
struct PartialSection {
    buffer: Box<ArrayVec<u8, MAX_PRIVATE_SECTION_SIZE>>,
}

impl PartialSection {
    fn write<F: SectionFilter>(
        &mut self,
        filter: &mut F,
        ctx: &mut Context,
        data: &[u8],
        is_start: bool,
    ) {
        if is_start {
            self.buffer.clear();
        } else if self.buffer.is_empty() {
            // 開始点を見ていないセクションの続きは処理できない
            return;
        }

        // バッファに収まる形でdataを追記
        let len = std::cmp::min(self.buffer.remaining_capacity(), data.len());
        let _result = self.buffer.try_extend_from_slice(&data[..len]);
        debug_assert!(_result.is_ok());

        let mut buf = self.buffer.as_slice();
        loop {
            let len = match Section::parse(buf) {
                Err(SectionError::InsufficientLength | SectionError::EndOfPsi) => break,
                Err(SectionError::Corrupted(len)) => {
                    log::debug!("section corrupted: {:?}", ctx.packet.pid());
                    len
                }
                Err(SectionError::Crc32(len)) => {
                    log::debug!("section crc32 error: {:?}", ctx.packet.pid());
                    len
                }
                Ok((section, len)) => {
                    filter.on_section(ctx, &section);
                    len
                }
            };

            // 読み込んだセクションの分バッファを進める
            buf = &buf[len..];
        }

        if buf.len() < self.buffer.len() {
            // 処理した部分を捨てる
            let remaining = buf.len();
            let offset = self.buffer.len() - remaining;
            self.buffer.copy_within(offset.., 0);
            self.buffer.truncate(remaining);
        }
    }
}
