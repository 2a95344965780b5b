use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use siprelay::message::SipMessage;
use siprelay::sdp;

const INVITE_WITH_SDP: &str = r#"INVITE sip:1002@sip.local SIP/2.0
Via: SIP/2.0/UDP 10.0.0.11:5062;rport;branch=z9hG4bK-5801fe38-17e8fd7-d661e03c
Max-Forwards: 70
From: "Alice"<sip:1001@sip.local>;tag=s26208d1i1z111r290308928
To: <sip:1002@sip.local>
Call-ID: 7034cb95-68867afa-17e8fd7-7fc19d58b7d0
CSeq: 1 INVITE
User-Agent: Bench UA 1.0
Supported: 100rel,timer,replaces
Allow: PRACK,BYE,CANCEL,ACK,INVITE,UPDATE,OPTIONS
Contact: <sip:1001@10.0.0.11:5062;transport=UDP>
Content-Type: application/sdp
Content-Length: 224

v=0
o=- 226208 26208 IN IP4 10.0.0.11
s=bench
c=IN IP4 10.0.0.11
t=0 0
m=audio 18076 RTP/AVP 8 0 18 116
a=rtpmap:8 PCMA/8000
a=ptime:20
a=rtpmap:0 PCMU/8000
a=rtpmap:18 G729/8000
a=rtpmap:116 telephone-event/8000
"#;

fn crlf(msg: &str) -> Vec<u8> {
    msg.replace('\n', "\r\n").into_bytes()
}

fn bench_parse(c: &mut Criterion) {
    let raw = crlf(INVITE_WITH_SDP);
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("invite_with_sdp", |b| {
        b.iter(|| SipMessage::parse(black_box(&raw)).unwrap())
    });
    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let raw = crlf(INVITE_WITH_SDP);
    let msg = SipMessage::parse(&raw).unwrap();
    c.bench_function("serialize_invite", |b| {
        b.iter(|| black_box(&msg).to_bytes())
    });
}

fn bench_sdp_rewrite(c: &mut Criterion) {
    let raw = crlf(INVITE_WITH_SDP);
    let msg = SipMessage::parse(&raw).unwrap();
    let body = msg.body_str().unwrap().to_string();
    c.bench_function("sdp_rewrite", |b| {
        b.iter(|| sdp::rewrite_sdp(black_box(&body), "203.0.113.5", 20000, None, false))
    });
}

criterion_group!(benches, bench_parse, bench_serialize, bench_sdp_rewrite);
criterion_main!(benches);
