//! EIT（Event Information Table）と、その実時間処理。
//!
//! [`EitProcessor`]はTSパケットを1つずつ受け取り、入力PID上のEITセクションを
//! 組み立て、サービスの選別・改名や開始時刻のずらしを施した上で、
//! 出力PIDのパケット列として同じパケット速度のまま再送出する。

use std::collections::VecDeque;
use std::num::NonZeroU16;
use std::ops::RangeInclusive;

use fxhash::FxHashSet;

use crate::demux::{Context, SectionDemux, SectionFilter, Table};
use crate::packet::Packet;
use crate::packetizer::{Packetizer, SectionProvider};
use crate::pid::Pid;
use crate::psi::{NetworkId, Section, ServiceId, TransportStreamId};
use crate::time::DateTime;
use crate::utils::BytesExt;

/// 自TSにおけるイベント［現在／次］を格納するEITのテーブルID。
pub const TABLE_ID_PF_ACTUAL: u8 = 0x4E;
/// 他TSにおけるイベント［現在／次］を格納するEITのテーブルID。
pub const TABLE_ID_PF_OTHER: u8 = 0x4F;
/// 自TSにおけるイベント［スケジュール］を格納するEITのテーブルID。
pub const TABLE_ID_SCHEDULE_ACTUAL: RangeInclusive<u8> = 0x50..=0x5F;
/// 他TSにおけるイベント［スケジュール］を格納するEITのテーブルID。
pub const TABLE_ID_SCHEDULE_OTHER: RangeInclusive<u8> = 0x60..=0x6F;

/// `table_id`がEITのものかどうかを返す。
#[inline]
pub fn is_eit(table_id: u8) -> bool {
    (TABLE_ID_PF_ACTUAL..=*TABLE_ID_SCHEDULE_OTHER.end()).contains(&table_id)
}

/// `table_id`がEIT［現在／次］のものかどうかを返す。
#[inline]
pub fn is_present_following(table_id: u8) -> bool {
    table_id == TABLE_ID_PF_ACTUAL || table_id == TABLE_ID_PF_OTHER
}

/// `table_id`がEIT［スケジュール］のものかどうかを返す。
#[inline]
pub fn is_schedule(table_id: u8) -> bool {
    TABLE_ID_SCHEDULE_ACTUAL.contains(&table_id) || TABLE_ID_SCHEDULE_OTHER.contains(&table_id)
}

/// `table_id`が自TSのEITのものかどうかを返す。
#[inline]
pub fn is_actual(table_id: u8) -> bool {
    table_id == TABLE_ID_PF_ACTUAL || TABLE_ID_SCHEDULE_ACTUAL.contains(&table_id)
}

/// イベント識別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub NonZeroU16);

crate::utils::impl_id!(EventId);

/// 進行状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunningStatus {
    /// 未定義。
    Undefined,
    /// 非実行中。
    NotRunning,
    /// 数秒以内に開始。
    StartsSoon,
    /// 停止中。
    Pausing,
    /// 実行中。
    Running,
    /// 予約。
    Reserved,
}

impl From<u8> for RunningStatus {
    #[inline]
    fn from(value: u8) -> RunningStatus {
        match value {
            0 => RunningStatus::Undefined,
            1 => RunningStatus::NotRunning,
            2 => RunningStatus::StartsSoon,
            3 => RunningStatus::Pausing,
            4 => RunningStatus::Running,
            _ => RunningStatus::Reserved,
        }
    }
}

/// EITセクションのペイロード固定部。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EitFixed {
    /// トランスポートストリーム識別。
    pub transport_stream_id: u16,
    /// オリジナルネットワーク識別。
    pub original_network_id: u16,
    /// セグメント最終セクション番号。
    pub segment_last_section_number: u8,
    /// 最終テーブル識別。
    pub last_table_id: u8,
}

/// EITセクション内の1イベント。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EitEvent {
    /// このイベントのペイロード先頭からのバイト位置。
    pub offset: usize,
    /// イベント識別。
    pub event_id: u16,
    /// 開始時刻のワイヤー上の5バイト。
    pub start_time: [u8; 5],
    /// 継続時間のワイヤー上の3バイト。
    pub duration: [u8; 3],
    /// 進行状態。
    pub running_status: RunningStatus,
    /// スクランブル。
    pub free_ca_mode: bool,
    /// 記述子領域のバイト数。
    pub descriptors_len: usize,
}

impl EitEvent {
    /// イベント先頭から開始時刻フィールドまでのバイト数。
    pub const START_TIME_OFFSET: usize = 2;

    /// 開始時刻を読み取る。未定義や不正なBCDの場合は`None`を返す。
    #[inline]
    pub fn start_time(&self) -> Option<DateTime> {
        DateTime::read(&self.start_time)
    }

    /// 継続時間を秒単位で読み取る。不正なBCDの場合は`None`を返す。
    #[inline]
    pub fn duration(&self) -> Option<u32> {
        crate::time::read_bcd_duration(&self.duration)
    }
}

/// EITセクションの読み取り結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EitSection {
    /// ペイロード固定部。
    pub fixed: EitFixed,
    /// イベントを格納する配列。
    pub events: Vec<EitEvent>,
}

impl EitSection {
    /// `section`からEITの構造を読み取る。
    ///
    /// EITのテーブルIDでない場合や構造が壊れている場合は`None`を返す。
    pub fn read(section: &Section) -> Option<EitSection> {
        if !is_eit(section.table_id()) || !section.is_long_section() {
            return None;
        }

        let mut buf = section.payload_buffer();
        if !buf.can_read_bytes(6) {
            log::debug!("invalid EitSection");
            return None;
        }

        let fixed = EitFixed {
            transport_stream_id: buf.get_u16(),
            original_network_id: buf.get_u16(),
            segment_last_section_number: buf.get_u8(),
            last_table_id: buf.get_u8(),
        };

        let mut events = Vec::new();
        while buf.can_read_bytes(12) {
            let offset = buf.read_position() / 8;
            let event_id = buf.get_u16();
            let start_time: [u8; 5] = buf.get_bytes(5).try_into().unwrap();
            let duration: [u8; 3] = buf.get_bytes(3).try_into().unwrap();
            let running_status = (buf.get_bits(3) as u8).into();
            let free_ca_mode = buf.get_bit();
            buf.push_read_length(12);
            let descriptors_len = buf.remaining_read_bytes();
            buf.pop_state();

            events.push(EitEvent {
                offset,
                event_id,
                start_time,
                duration,
                running_status,
                free_ca_mode,
                descriptors_len,
            });
        }

        if buf.error() {
            log::debug!("invalid EitEvent");
            return None;
        }

        Some(EitSection { fixed, events })
    }
}

/// サービスを指定する参照。
///
/// 各要素は独立に省略でき、省略された要素は任意の値に一致する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceRef {
    /// オリジナルネットワーク識別。
    pub original_network_id: Option<NetworkId>,
    /// トランスポートストリーム識別。
    pub transport_stream_id: Option<TransportStreamId>,
    /// サービス識別。
    pub service_id: Option<ServiceId>,
}

impl ServiceRef {
    /// サービス識別のみを指定した`ServiceRef`を生成する。
    #[inline]
    pub fn from_service_id(service_id: ServiceId) -> ServiceRef {
        ServiceRef {
            service_id: Some(service_id),
            ..ServiceRef::default()
        }
    }

    /// 指定されている要素が全て一致する場合にのみ一致とみなす。
    pub fn matches(&self, original_network_id: u16, transport_stream_id: u16, service_id: u16) -> bool {
        self.original_network_id
            .map_or(true, |id| id.get() == original_network_id)
            && self
                .transport_stream_id
                .map_or(true, |id| id.get() == transport_stream_id)
            && self.service_id.map_or(true, |id| id.get() == service_id)
    }
}

/// 取り込んだセクションを溜めておくキューの既定の上限。
pub const DEFAULT_MAX_QUEUED_SECTIONS: usize = 1000;
/// キュー上限の下限。
pub const MIN_MAX_QUEUED_SECTIONS: usize = 16;

/// EITセクションを実時間で書き換えて再送出するプロセッサー。
///
/// パケットを1つ受け取る呼び出しの中で全ての処理が完結し、ブロックする
/// 操作は行わない。入力PID上のパケットは出力パケットに置き換えられるため、
/// パケット速度は変化しない。
pub struct EitProcessor {
    demux: SectionDemux<Rewriter>,
    packetizer: Packetizer,
}

impl EitProcessor {
    /// 入力・出力とも`pid`を使う`EitProcessor`を生成する。
    pub fn new(pid: Pid) -> EitProcessor {
        EitProcessor {
            demux: SectionDemux::new(Rewriter::new(pid)),
            packetizer: Packetizer::new(pid),
        }
    }

    /// `pid`を入力PIDに加える。
    #[inline]
    pub fn add_input_pid(&mut self, pid: Pid) {
        self.demux.table_mut().set(pid);
    }

    /// 出力PIDを設定する。
    #[inline]
    pub fn set_output_pid(&mut self, pid: Pid) {
        self.packetizer.set_pid(pid);
    }

    /// キューに溜めるセクション数の上限を設定する。
    ///
    /// [`MIN_MAX_QUEUED_SECTIONS`]未満は下限に切り上げられる。
    pub fn set_max_queued(&mut self, max: usize) {
        self.demux.filter_mut().max_queued = max.max(MIN_MAX_QUEUED_SECTIONS);
    }

    /// `table_ids`のテーブルIDを持つセクションを破棄するよう設定する。
    pub fn remove_table_ids<I: IntoIterator<Item = u8>>(&mut self, table_ids: I) {
        self.demux.filter_mut().drop_table_ids.extend(table_ids);
    }

    /// EIT［スケジュール］を全て破棄するよう設定する。
    pub fn remove_schedule(&mut self) {
        self.remove_table_ids(TABLE_ID_SCHEDULE_ACTUAL.chain(TABLE_ID_SCHEDULE_OTHER));
    }

    /// 他TSのEITを全て破棄するよう設定する。
    pub fn remove_other(&mut self) {
        self.remove_table_ids(std::iter::once(TABLE_ID_PF_OTHER).chain(TABLE_ID_SCHEDULE_OTHER));
    }

    /// `service`に一致するサービスのEITだけを残すよう設定する。
    ///
    /// 残す設定が1つでもあると、いずれにも一致しないサービスのEITは
    /// 全て破棄される。残す設定は破棄する設定より優先される。
    pub fn keep_service(&mut self, service: ServiceRef) {
        self.demux.filter_mut().keeps.push(service);
    }

    /// `service`に一致するサービスのEITを破棄するよう設定する。
    pub fn remove_service(&mut self, service: ServiceRef) {
        self.demux.filter_mut().removes.push(service);
    }

    /// `from`に一致するサービスのEITの識別子を`to`で指定された値に
    /// 書き換えるよう設定する。
    ///
    /// 複数の設定に一致する場合は最初に登録されたものが適用される。
    pub fn rename_service(&mut self, from: ServiceRef, to: ServiceRef) {
        self.demux.filter_mut().renames.push((from, to));
    }

    /// 全イベントの開始時刻をずらすオフセットをミリ秒単位で設定する。
    ///
    /// 適用は秒単位で行われる。`date_only`の場合は日付部分だけが
    /// 書き換えられる（ずらした結果の時刻は全体から計算される）。
    pub fn set_start_time_offset(&mut self, millis: i64, date_only: bool) {
        let rewriter = self.demux.filter_mut();
        rewriter.time_offset_millis = millis;
        rewriter.date_only = date_only;
    }

    /// 現在キューに溜まっているセクション数を返す。
    #[inline]
    pub fn section_count(&self) -> usize {
        self.demux.filter().queue.len()
    }

    /// キューあふれで破棄されたセクション数を返す。
    #[inline]
    pub fn dropped_count(&self) -> u64 {
        self.demux.filter().dropped
    }

    /// 全ての設定とキューを消去して初期状態に戻す。入力・出力PIDは変わらない。
    pub fn reset(&mut self) {
        let rewriter = self.demux.filter_mut();
        rewriter.drop_table_ids.clear();
        rewriter.keeps.clear();
        rewriter.removes.clear();
        rewriter.renames.clear();
        rewriter.time_offset_millis = 0;
        rewriter.date_only = false;
        rewriter.queue.clear();
        rewriter.dropped = 0;
        self.packetizer.reset();
    }

    /// パケットを1つ処理する。
    ///
    /// 入力PID上のパケットは出力パケットに置き換えられる。送出すべき
    /// セクションがない場合はヌルパケットになる。
    pub fn process_packet(&mut self, packet: &mut Packet) {
        self.demux.feed(packet);
        if self.demux.is_tracked(packet.pid()) {
            *packet = self.packetizer.next_packet(self.demux.filter_mut());
        }
    }
}

/// [`EitProcessor`]の内部で書き換えとキュー管理を行うフィルター。
struct Rewriter {
    input_pid: Pid,
    drop_table_ids: FxHashSet<u8>,
    keeps: Vec<ServiceRef>,
    removes: Vec<ServiceRef>,
    renames: Vec<(ServiceRef, ServiceRef)>,
    time_offset_millis: i64,
    date_only: bool,
    queue: VecDeque<Section>,
    max_queued: usize,
    dropped: u64,
}

impl Rewriter {
    fn new(input_pid: Pid) -> Rewriter {
        Rewriter {
            input_pid,
            drop_table_ids: FxHashSet::default(),
            keeps: Vec::new(),
            removes: Vec::new(),
            renames: Vec::new(),
            time_offset_millis: 0,
            date_only: false,
            queue: VecDeque::new(),
            max_queued: DEFAULT_MAX_QUEUED_SECTIONS,
            dropped: 0,
        }
    }

    fn enqueue(&mut self, section: Section) {
        if self.queue.len() >= self.max_queued {
            // パケット処理を止めるわけにはいかないため新しい方を捨てる
            self.dropped += 1;
            log::warn!(
                "eit section queue overflow, dropping section: table_id={:#04X} size={}",
                section.table_id(),
                section.size(),
            );
            return;
        }
        self.queue.push_back(section);
    }

    /// 全イベントの開始時刻をずらす。バイト列が変化した場合に`true`を返す。
    fn shift_start_times(&self, section: &mut Section) -> bool {
        let offset = self.time_offset_millis / 1000;
        if offset == 0 {
            return false;
        }

        let Some(eit) = EitSection::read(section) else {
            log::debug!(
                "eit section not rewritable, leaving as is: table_id={:#04X}",
                section.table_id(),
            );
            return false;
        };

        let mut changed = false;
        for event in &eit.events {
            match event.start_time().and_then(|dt| dt.shifted(offset)) {
                Some(shifted) => {
                    let pos = event.offset + EitEvent::START_TIME_OFFSET;
                    let payload = section.payload_mut();
                    if self.date_only {
                        payload[pos..pos + 2].copy_from_slice(&shifted.date.write());
                    } else {
                        payload[pos..pos + 5].copy_from_slice(&shifted.write());
                    }
                    changed = true;
                }
                None => {
                    // このイベントの時刻だけ書き換えを諦める
                    log::debug!(
                        "eit event start time not decodable: table_id={:#04X} event_id={}",
                        section.table_id(),
                        event.event_id,
                    );
                }
            }
        }
        changed
    }
}

impl SectionFilter for Rewriter {
    fn on_setup(&mut self) -> Table {
        let mut table = Table::new();
        table.set(self.input_pid);
        table
    }

    fn on_section(&mut self, _ctx: &mut Context, section: &Section) {
        if self.drop_table_ids.contains(&section.table_id()) {
            return;
        }
        if !is_eit(section.table_id()) || !section.is_long_section() {
            // EIT以外はそのまま通す
            self.enqueue(section.clone());
            return;
        }

        let service_id = section.table_id_extension();
        let payload = section.payload();
        let (transport_stream_id, original_network_id) = if payload.len() >= 4 {
            (payload[0..2].read_be_16(), payload[2..4].read_be_16())
        } else {
            (0, 0)
        };

        let kept = self
            .keeps
            .iter()
            .any(|r| r.matches(original_network_id, transport_stream_id, service_id));
        if !self.keeps.is_empty() && !kept {
            return;
        }
        if !kept
            && self
                .removes
                .iter()
                .any(|r| r.matches(original_network_id, transport_stream_id, service_id))
        {
            return;
        }

        // 分離されたセクションは他と共有され得るため、複製に手を入れる
        let mut copy = section.clone();
        let mut changed = false;

        if let Some((_, to)) = self
            .renames
            .iter()
            .find(|(from, _)| from.matches(original_network_id, transport_stream_id, service_id))
        {
            if let Some(id) = to.service_id {
                copy.set_table_id_extension(id.get());
                changed = true;
            }
            if copy.payload().len() >= 4 {
                if let Some(id) = to.transport_stream_id {
                    copy.payload_mut()[0..2].copy_from_slice(&id.get().to_be_bytes());
                    changed = true;
                }
                if let Some(id) = to.original_network_id {
                    copy.payload_mut()[2..4].copy_from_slice(&id.get().to_be_bytes());
                    changed = true;
                }
            }
        }

        if self.time_offset_millis != 0 {
            changed |= self.shift_start_times(&mut copy);
        }

        if changed {
            copy.recompute_crc();
        }
        self.enqueue(copy);
    }
}

impl SectionProvider for Rewriter {
    #[inline]
    fn next_section(&mut self) -> Option<Section> {
        self.queue.pop_front()
    }
}
