//! セクションをTSパケット列に直列化するためのモジュール。

use crate::packet::Packet;
use crate::pid::Pid;
use crate::psi::Section;

/// [`Packetizer`]にセクションを供給するためのトレイト。
pub trait SectionProvider {
    /// 次に送出すべきセクションを返す。
    ///
    /// 送出すべきセクションがない場合は`None`を返す。ブロックしてはならない。
    fn next_section(&mut self) -> Option<Section>;
}

impl<T: SectionProvider + ?Sized> SectionProvider for &mut T {
    #[inline]
    fn next_section(&mut self) -> Option<Section> {
        (**self).next_section()
    }
}

/// [`std::collections::VecDeque`]からセクションを取り出す。
impl SectionProvider for std::collections::VecDeque<Section> {
    #[inline]
    fn next_section(&mut self) -> Option<Section> {
        self.pop_front()
    }
}

/// セクションの連なりを1つのPIDのTSパケット列に直列化する。
///
/// 呼び出しは送出するパケット1つにつき1回で、送出中のセクションがあれば
/// その続きを、なければ供給元から次のセクションを取り出してパケットを作る。
/// 供給がない場合はヌルパケットを返し、セクションを勝手に作り出すことはない。
pub struct Packetizer {
    pid: Pid,
    continuity_counter: u8,
    /// 送出中のセクションと送出済みバイト数。
    current: Option<(Section, usize)>,
    packet_count: u64,
    section_count: u64,
}

impl Packetizer {
    /// `pid`に送出する`Packetizer`を生成する。
    pub fn new(pid: Pid) -> Packetizer {
        Packetizer {
            pid,
            continuity_counter: 0,
            current: None,
            packet_count: 0,
            section_count: 0,
        }
    }

    /// 送出先のPIDを返す。
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// 送出先のPIDを設定する。
    #[inline]
    pub fn set_pid(&mut self, pid: Pid) {
        self.pid = pid;
    }

    /// これまでに生成したパケット数（ヌルパケットを除く）を返す。
    #[inline]
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// これまでに送出し終えたセクション数を返す。
    #[inline]
    pub fn section_count(&self) -> u64 {
        self.section_count
    }

    /// 送出中のセクションを破棄して初期状態に戻す。
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// パケットを1つ生成する。
    ///
    /// 送出すべきセクションがない場合はヌルパケットを返す。
    pub fn next_packet<P: SectionProvider>(&mut self, provider: &mut P) -> Packet {
        let mut data = [0xFFu8; Packet::SIZE - 4];
        let mut pos = 0;

        // 送出中のセクションの続き
        let mut finished = false;
        if let Some((section, offset)) = &mut self.current {
            let remaining = section.size() - *offset;
            let n = std::cmp::min(remaining, data.len());
            data[..n].copy_from_slice(&section.as_bytes()[*offset..*offset + n]);
            *offset += n;
            pos = n;

            if *offset < section.size() {
                // このパケットは続きだけで埋まる
                return self.build(false, &data);
            }
            finished = true;
        }
        if finished {
            self.current = None;
            self.section_count += 1;
        }

        // 新しいセクションを開始できる場合はポインターフィールドを挿入する
        let mut pusi = false;
        if pos + 2 <= data.len() {
            if let Some(section) = provider.next_section() {
                data.copy_within(..pos, 1);
                data[0] = pos as u8;
                pos += 1;
                pusi = true;
                self.current = Some((section, 0));

                while pos < data.len() {
                    if self.current.is_none() {
                        match provider.next_section() {
                            Some(section) => self.current = Some((section, 0)),
                            None => break,
                        }
                    }

                    // 直前で設定済み
                    let (section, offset) = self.current.as_mut().unwrap();
                    let remaining = section.size() - *offset;
                    let n = std::cmp::min(remaining, data.len() - pos);
                    data[pos..pos + n].copy_from_slice(&section.as_bytes()[*offset..*offset + n]);
                    *offset += n;
                    pos += n;

                    if *offset >= section.size() {
                        self.current = None;
                        self.section_count += 1;
                    }
                }
            }
        }

        if pos == 0 {
            // 送出するものがない
            return Packet::null();
        }

        self.build(pusi, &data)
    }

    fn build(&mut self, pusi: bool, data: &[u8; Packet::SIZE - 4]) -> Packet {
        let mut buf = [0u8; Packet::SIZE];
        buf[0] = 0x47;
        buf[1] = (pusi as u8) << 6 | (self.pid.get() >> 8) as u8;
        buf[2] = self.pid.get() as u8;
        buf[3] = 0b0001_0000 | self.continuity_counter;
        buf[4..].copy_from_slice(data);

        self.continuity_counter = (self.continuity_counter + 1) & 0x0F;
        self.packet_count += 1;
        Packet(buf)
    }
}
