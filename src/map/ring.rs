use std::collections::BTreeMap;
use xxhash_rust::xxh64::xxh64;

/// 1サーバーあたりの仮想ノード数
pub const VIRTUAL_NODES_PER_SERVER: usize = 150;

/// Consistent Hashing用のxxHashシード
pub const XXHASH_SEED: u64 = 0;

/// マップサーバーのインデックス
pub type ServerIndex = u32;

type RingPosition = u64;

/// Consistent Hashingリング
///
/// グループキー `-1`（ハッシュ配置）で書き込まれたキーの担当サーバーを決める。
/// 仮想ノードを使ってサーバー間でキーを均等に分散する。
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    /// リング上の位置 -> サーバー
    ring: BTreeMap<RingPosition, ServerIndex>,

    /// 物理サーバー (追加順)
    servers: Vec<ServerIndex>,

    virtual_nodes_per_server: usize,
}

impl ConsistentHashRing {
    pub fn new() -> Self {
        Self::with_virtual_nodes(VIRTUAL_NODES_PER_SERVER)
    }

    pub fn with_virtual_nodes(virtual_nodes_per_server: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            servers: Vec::new(),
            virtual_nodes_per_server,
        }
    }

    /// `0..count` のサーバーを持つリングを作成
    pub fn with_servers(count: ServerIndex) -> Self {
        let mut ring = Self::new();
        for server in 0..count {
            ring.add_server(server);
        }
        ring
    }

    /// サーバーをリングに追加
    pub fn add_server(&mut self, server: ServerIndex) {
        if self.servers.contains(&server) {
            tracing::warn!("Server {} already exists in the ring", server);
            return;
        }

        self.servers.push(server);

        for i in 0..self.virtual_nodes_per_server {
            let virtual_node_key = format!("server-{}:{}", server, i);
            let position = xxh64(virtual_node_key.as_bytes(), XXHASH_SEED);
            self.ring.insert(position, server);
        }

        tracing::debug!(
            "Added map server {} with {} virtual nodes",
            server,
            self.virtual_nodes_per_server
        );
    }

    /// キーを担当するサーバーを取得
    ///
    /// キーのハッシュ以上で最小の仮想ノードを選び、なければ先頭に戻る。
    pub fn get_server(&self, key: &str) -> Option<ServerIndex> {
        let hash = xxh64(key.as_bytes(), XXHASH_SEED);

        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_pos, server)| *server)
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn virtual_node_count(&self) -> usize {
        self.ring.len()
    }
}

impl Default for ConsistentHashRing {
    fn default() -> Self {
        Self::new()
    }
}
