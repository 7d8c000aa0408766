/// リクエスト元クライアントの情報（監査・信頼済みデバイス登録用）
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}
