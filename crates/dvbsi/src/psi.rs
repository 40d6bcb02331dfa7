//! PSI・SIのセクション。

use std::fmt;
use std::num::NonZeroU16;

use thiserror::Error;

use crate::buffer::BitBuffer;
use crate::crc32;
use crate::utils::BytesExt;

/// 標準形式のセクションの最大サイズ。
pub const MAX_PSI_SECTION_SIZE: usize = 1024;
/// プライベートセクションの最大サイズ。
pub const MAX_PRIVATE_SECTION_SIZE: usize = 4096;
/// 短形式セクションのヘッダーサイズ。
pub const SHORT_HEADER_SIZE: usize = 3;
/// 長形式セクションのヘッダーサイズ。
pub const LONG_HEADER_SIZE: usize = 8;
/// 長形式セクション末尾のCRC32のサイズ。
pub const CRC_SIZE: usize = 4;
/// 長形式セクションのペイロードの最大サイズ。
pub const MAX_LONG_PAYLOAD_SIZE: usize = MAX_PRIVATE_SECTION_SIZE - LONG_HEADER_SIZE - CRC_SIZE;

/// ネットワーク識別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkId(pub NonZeroU16);

crate::utils::impl_id!(NetworkId);

/// トランスポートストリーム識別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportStreamId(pub NonZeroU16);

crate::utils::impl_id!(TransportStreamId);

/// サービス識別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub NonZeroU16);

crate::utils::impl_id!(ServiceId);

/// [`Section::parse`]で発生するエラー。
///
/// セクション長が確定したあとで発生するエラーにはセクション長が付随する。
#[derive(Debug, Error)]
pub enum SectionError {
    /// セクションの長さが足りない。
    #[error("insufficient length of a section")]
    InsufficientLength,

    /// セクションの終端（スタッフィング）に到達した。
    #[error("reached to end of sections")]
    EndOfPsi,

    /// セクションに最低限必要なバイト数がなく、壊れたセクションである。
    ///
    /// 内包する`usize`にはセクション長が入る。
    #[error("corrupt section")]
    Corrupted(usize),

    /// セクションのCRC32が一致しない。
    ///
    /// 内包する`usize`にはセクション長が入る。
    #[error("crc32 error")]
    Crc32(usize),
}

/// PSI・SIのセクション。
///
/// ヘッダー・ペイロード・（長形式では）CRC32を含むワイヤー上のバイト列を
/// そのまま所有する。
#[derive(Clone, PartialEq, Eq)]
pub struct Section {
    data: Vec<u8>,
}

impl Section {
    /// `buf`の先頭からセクションをパースし、[`Section`]とセクション全体の
    /// バイト数を返す。
    ///
    /// 長形式セクションはCRC32が検証され、一致しない場合は受け付けない。
    pub fn parse(buf: &[u8]) -> Result<(Section, usize), SectionError> {
        if buf.len() < SHORT_HEADER_SIZE {
            return Err(SectionError::InsufficientLength);
        }

        let table_id = buf[0];
        if table_id == 0xFF {
            return Err(SectionError::EndOfPsi);
        }
        let section_syntax_indicator = buf[1] & 0b10000000 != 0;
        let section_length = (buf[1..=2].read_be_16() & 0b0000_1111_1111_1111) as usize;

        let total = SHORT_HEADER_SIZE + section_length;
        let Some(data) = buf.get(..total) else {
            return Err(SectionError::InsufficientLength);
        };
        if total > MAX_PRIVATE_SECTION_SIZE {
            return Err(SectionError::Corrupted(total));
        }

        if section_syntax_indicator {
            if total < LONG_HEADER_SIZE + CRC_SIZE {
                return Err(SectionError::Corrupted(total));
            }
            if !crc32::calc(data) {
                return Err(SectionError::Crc32(total));
            }
        }

        Ok((Section { data: data.to_vec() }, total))
    }

    /// 短形式セクションを生成する。
    ///
    /// # パニック
    ///
    /// ペイロードが最大サイズを超える際はパニックする。
    pub fn new_short(table_id: u8, private: bool, payload: &[u8]) -> Section {
        let max = if private {
            MAX_PRIVATE_SECTION_SIZE
        } else {
            MAX_PSI_SECTION_SIZE
        };
        assert!(SHORT_HEADER_SIZE + payload.len() <= max);

        let mut buf = BitBuffer::with_max_size(MAX_PRIVATE_SECTION_SIZE);
        buf.put_u8(table_id);
        buf.put_bit(false);
        buf.put_bit(private);
        buf.put_bits(0b11, 2);
        buf.push_write_length(12);
        buf.put_bytes(payload);
        buf.pop_state();
        debug_assert!(!buf.error());

        Section {
            data: buf.into_vec(),
        }
    }

    /// 長形式セクションを生成する。CRC32も計算される。
    ///
    /// # パニック
    ///
    /// ペイロードが最大サイズを超える際、またはバージョンが31を超える際は
    /// パニックする。
    #[allow(clippy::too_many_arguments)]
    pub fn new_long(
        table_id: u8,
        private: bool,
        table_id_extension: u16,
        version_number: u8,
        current_next_indicator: bool,
        section_number: u8,
        last_section_number: u8,
        payload: &[u8],
    ) -> Section {
        assert!(version_number < 32);
        assert!(payload.len() <= MAX_LONG_PAYLOAD_SIZE);

        let mut buf = BitBuffer::with_max_size(MAX_PRIVATE_SECTION_SIZE);
        buf.put_u8(table_id);
        buf.put_bit(true);
        buf.put_bit(private);
        buf.put_bits(0b11, 2);
        buf.push_write_length(12);
        buf.put_u16(table_id_extension);
        buf.put_bits(0b11, 2);
        buf.put_bits(version_number as u64, 5);
        buf.put_bit(current_next_indicator);
        buf.put_u8(section_number);
        buf.put_u8(last_section_number);
        buf.put_bytes(payload);
        // CRC32の場所
        buf.put_u32(0);
        buf.pop_state();
        debug_assert!(!buf.error());

        let mut section = Section {
            data: buf.into_vec(),
        };
        section.recompute_crc();
        section
    }

    /// セクション全体のバイト列を返す。
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// セクション全体のバイト数を返す。
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// テーブル識別を返す。
    #[inline]
    pub fn table_id(&self) -> u8 {
        self.data[0]
    }

    /// 長形式（セクションシンタクス付き）かどうかを返す。
    #[inline]
    pub fn is_long_section(&self) -> bool {
        self.data[1] & 0b10000000 != 0
    }

    /// 短形式かどうかを返す。
    #[inline]
    pub fn is_short_section(&self) -> bool {
        !self.is_long_section()
    }

    /// プライベートインジケーターを返す。
    #[inline]
    pub fn private_indicator(&self) -> bool {
        self.data[1] & 0b01000000 != 0
    }

    /// section_lengthフィールドの値を返す。
    #[inline]
    pub fn section_length(&self) -> usize {
        (self.data[1..=2].read_be_16() & 0b0000_1111_1111_1111) as usize
    }

    /// テーブル識別拡張を返す。
    ///
    /// # パニック
    ///
    /// 短形式セクションの際はパニックする。
    #[inline]
    pub fn table_id_extension(&self) -> u16 {
        assert!(self.is_long_section());
        self.data[3..=4].read_be_16()
    }

    /// バージョン番号（5ビット）を返す。
    ///
    /// # パニック
    ///
    /// 短形式セクションの際はパニックする。
    #[inline]
    pub fn version_number(&self) -> u8 {
        assert!(self.is_long_section());
        (self.data[5] & 0b00111110) >> 1
    }

    /// カレントネクスト指示を返す。
    ///
    /// # パニック
    ///
    /// 短形式セクションの際はパニックする。
    #[inline]
    pub fn current_next_indicator(&self) -> bool {
        assert!(self.is_long_section());
        self.data[5] & 0b00000001 != 0
    }

    /// セクション番号を返す。
    ///
    /// # パニック
    ///
    /// 短形式セクションの際はパニックする。
    #[inline]
    pub fn section_number(&self) -> u8 {
        assert!(self.is_long_section());
        self.data[6]
    }

    /// 最終セクション番号を返す。
    ///
    /// # パニック
    ///
    /// 短形式セクションの際はパニックする。
    #[inline]
    pub fn last_section_number(&self) -> u8 {
        assert!(self.is_long_section());
        self.data[7]
    }

    #[inline]
    fn payload_range(&self) -> std::ops::Range<usize> {
        if self.is_long_section() {
            LONG_HEADER_SIZE..self.data.len() - CRC_SIZE
        } else {
            SHORT_HEADER_SIZE..self.data.len()
        }
    }

    /// ペイロードを返す。
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_range()]
    }

    /// ペイロードを可変で返す。
    ///
    /// 書き換えた場合は[`Section::recompute_crc`]を呼ぶこと。
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let range = self.payload_range();
        &mut self.data[range]
    }

    /// ペイロードを読み取る[`BitBuffer`]を生成する。
    #[inline]
    pub fn payload_buffer(&self) -> BitBuffer {
        BitBuffer::from_bytes(self.payload())
    }

    /// セクション末尾のCRC32を返す。
    ///
    /// # パニック
    ///
    /// 短形式セクションの際はパニックする。
    #[inline]
    pub fn crc32(&self) -> u32 {
        assert!(self.is_long_section());
        self.data[self.data.len() - CRC_SIZE..].read_be_32()
    }

    /// テーブル識別拡張を書き換える。
    ///
    /// 書き換えた場合は[`Section::recompute_crc`]を呼ぶこと。
    ///
    /// # パニック
    ///
    /// 短形式セクションの際はパニックする。
    pub fn set_table_id_extension(&mut self, table_id_extension: u16) {
        assert!(self.is_long_section());
        self.data[3..=4].copy_from_slice(&table_id_extension.to_be_bytes());
    }

    /// セクション末尾のCRC32を現在の内容で計算し直す。
    ///
    /// # パニック
    ///
    /// 短形式セクションの際はパニックする。
    pub fn recompute_crc(&mut self) {
        assert!(self.is_long_section());
        let end = self.data.len() - CRC_SIZE;
        let crc = crc32::value(&self.data[..end]);
        self.data[end..].copy_from_slice(&crc.to_be_bytes());
    }
}

impl fmt::Debug for Section {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = f.debug_struct("Section");
        s.field("table_id", &self.table_id())
            .field("is_long_section", &self.is_long_section())
            .field("section_length", &self.section_length());
        if self.is_long_section() {
            s.field("table_id_extension", &self.table_id_extension())
                .field("version_number", &self.version_number())
                .field("section_number", &self.section_number())
                .field("last_section_number", &self.last_section_number());
        }
        s.finish_non_exhaustive()
    }
}
