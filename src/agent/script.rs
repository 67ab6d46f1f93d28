//! The remote analysis script, uploaded to every host on connect.
//!
//! POSIX sh requiring GNU awk (for `-b` byte offsets) and coreutils. One
//! command per stdin line; every reply ends with `D` or `F <reason>`; EOF
//! on stdin exits.

pub const SCRIPT_VERSION: &str = "0.1.0";

/// Printed by `agent.sh --version`; the bootstrap compares against this to
/// decide whether an upload is needed.
pub fn version_line(version: &str) -> String {
    format!("loghive-agent {}", version)
}

pub const SCRIPT_BODY: &str = r#"#!/bin/sh
# loghive remote agent. Speaks a line-framed protocol on stdin/stdout:
#   IDX <b64 json>   refresh or rebuild one file's minute index, reply I rows
#   RUN <b64 json>   run one query, reply H/M/E/T rows
#   LS               probe for a usable log source, reply S rows
# Every reply terminates with D (ok) or F <reason>. EOF on stdin exits.

VERSION=0.1.0

case "$1" in
--version)
    echo "loghive-agent $VERSION"
    exit 0
    ;;
esac

STATE_DIR="${LOGHIVE_STATE_DIR:-$(cd "$(dirname "$0")" && pwd)}"
WORK="$STATE_DIR/work.$$"
mkdir -p "$STATE_DIR" || { echo "F cannot create state dir $STATE_DIR"; exit 1; }

command -v gawk >/dev/null 2>&1 || { echo "F gawk not found on remote host"; exit 1; }

cleanup() { rm -rf "$WORK"; }
trap cleanup EXIT

# Shared awk timestamp parser: ISO 8601 and traditional syslog prefixes,
# interpreted in this host's own timezone (the one the logs are written in).
AWK_TS='
BEGIN {
    split("Jan Feb Mar Apr May Jun Jul Aug Sep Oct Nov Dec", mnames, " ")
    for (mi = 1; mi <= 12; mi++) MON[mnames[mi]] = mi
    NOW = systime()
    THIS_YEAR = strftime("%Y", NOW)
}
function parse_ts(line,    s, a, t) {
    if (match(line, /^[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9][T ][0-9][0-9]:[0-9][0-9]:[0-9][0-9]/)) {
        s = substr(line, RSTART, RLENGTH)
        gsub(/[-T:]/, " ", s)
        return mktime(s)
    }
    if (match(line, /^[A-Z][a-z][a-z] +[0-9][0-9]* [0-9][0-9]:[0-9][0-9]:[0-9][0-9]/)) {
        split(substr(line, RSTART, RLENGTH), a, /[ :]+/)
        if (!(a[1] in MON)) return -1
        t = mktime(THIS_YEAR " " MON[a[1]] " " a[2] " " a[3] " " a[4] " " a[5])
        # A syslog date far in the future belongs to the previous year.
        if (t > NOW + 172800) t = mktime((THIS_YEAR - 1) " " MON[a[1]] " " a[2] " " a[3] " " a[4] " " a[5])
        return t
    }
    return -1
}
'

# json_get <json> <key>: scalar field of a flat JSON object.
json_get() {
    printf '%s\n' "$1" | gawk -v key="$2" '
    {
        if (!match($0, "\"" key "\"[ \t]*:")) next
        rest = substr($0, RSTART + RLENGTH)
        sub(/^[ \t]*/, "", rest)
        if (substr(rest, 1, 1) == "\"") {
            rest = substr(rest, 2)
            print substr(rest, 1, index(rest, "\"") - 1)
        } else if (match(rest, /^[^,}]+/)) {
            print substr(rest, RSTART, RLENGTH)
        }
        exit
    }'
}

# json_files <json>: the "files" array as "file<TAB>start<TAB>end" rows,
# end -1 meaning EOF. Relies on the compact serialization the client sends.
json_files() {
    printf '%s\n' "$1" | gawk '
    {
        if (!match($0, /"files":\[/)) next
        rest = substr($0, RSTART + RLENGTH)
        end = index(rest, "]")
        if (end == 0) next
        body = substr(rest, 1, end - 1)
        n = split(body, objs, /\},\{/)
        for (i = 1; i <= n; i++) {
            obj = objs[i]
            gsub(/[{}]/, "", obj)
            file = ""; start = 0; stop = -1
            if (match(obj, /"file":"[^"]*"/)) {
                file = substr(obj, RSTART + 8, RLENGTH - 9)
            }
            if (match(obj, /"start_offset":[0-9]+/)) {
                start = substr(obj, RSTART + 15, RLENGTH - 15)
            }
            if (match(obj, /"end_offset":[0-9]+/)) {
                stop = substr(obj, RSTART + 13, RLENGTH - 13)
            }
            if (file != "") printf "%s\t%s\t%s\n", file, start, stop
        }
    }'
}

sidecar_base() {
    printf '%s' "$1" | tr '/.' '__'
}

# handle_idx <b64 payload>
handle_idx() {
    args=$(printf '%s\n' "$1" | base64 -d 2>/dev/null) || { echo "F bad IDX payload"; return; }
    file=$(json_get "$args" file)
    rebuild=$(json_get "$args" rebuild)

    if [ ! -r "$file" ]; then
        echo "F no such file: $file"
        return
    fi

    base=$(sidecar_base "$file")
    idx="$STATE_DIR/$base.idx"
    sizef="$STATE_DIR/$base.size"

    prev_size=0
    last_min=-1
    if [ "$rebuild" = "true" ] || [ ! -f "$idx" ] || [ ! -f "$sizef" ]; then
        : > "$idx"
    else
        prev_size=$(cat "$sizef")
        cur_size=$(wc -c < "$file")
        if [ "$cur_size" -lt "$prev_size" ]; then
            # Rotated underneath us: rebuild from zero.
            : > "$idx"
            prev_size=0
        else
            last_min=$(tail -n 1 "$idx" | cut -d' ' -f1)
            [ -n "$last_min" ] || last_min=-1
        fi
    fi

    new_size=$(wc -c < "$file")
    if [ "$new_size" -gt "$prev_size" ]; then
        tail -c +$((prev_size + 1)) "$file" | head -c $((new_size - prev_size)) | \
            gawk -b -v base="$prev_size" -v lastmin="$last_min" "$AWK_TS"'
            {
                off = base + cur
                cur += length($0) + 1
                ts = parse_ts($0)
                if (ts < 0) next
                m = int(ts / 60)
                if (m > lastmin) { print m, off; lastmin = m }
            }' >> "$idx"
    fi
    printf '%s\n' "$new_size" > "$sizef"

    while read -r m o; do
        echo "I $m $o"
    done < "$idx"
    echo "D"
}

# handle_run <b64 payload>
handle_run() {
    args=$(printf '%s\n' "$1" | base64 -d 2>/dev/null) || { echo "F bad RUN payload"; return; }
    from=$(json_get "$args" from_minute)
    to=$(json_get "$args" to_minute)
    maxm=$(json_get "$args" max_messages)
    journal=$(json_get "$args" journal)
    pattern=$(json_get "$args" pattern)
    tz=$(json_get "$args" timezone)
    [ -n "$from" ] && [ -n "$to" ] && [ -n "$maxm" ] || { echo "F missing query bounds"; return; }
    [ -n "$pattern" ] || pattern="1"

    mkdir -p "$WORK"
    matches="$WORK/matches"
    histo="$WORK/histo"
    : > "$matches"
    : > "$histo"

    # The filter is an awk condition; histogram covers every match while the
    # message set is trimmed to the newest $maxm afterwards.
    scan='
    {
        off = base + cur
        cur += length($0) + 1
        ts = parse_ts($0)
        if (ts < 0) next
        m = int(ts / 60)
        if (m < FROM || m >= TO) next
        if (!('"$pattern"')) next
        hist[m]++
        printf "%s\037%s:%s\037%s\n", ts, FILE, off, $0 >> MATCHES
    }
    END { for (m in hist) print m, hist[m] >> HISTO }
    '

    scanned=0
    if [ "$journal" = "true" ]; then
        command -v journalctl >/dev/null 2>&1 || { echo "F journalctl not found"; return; }
        # Subshell keeps the TZ override away from later file scans.
        (
            [ -n "$tz" ] && export TZ="$tz"
            journalctl -q --no-pager -o short-iso \
                --since "@$((from * 60))" --until "@$((to * 60))" 2>/dev/null | \
                gawk -b -v base=0 -v FROM="$from" -v TO="$to" \
                    -v FILE="journalctl" -v MATCHES="$matches" -v HISTO="$histo" \
                    "$AWK_TS$scan"
        )
        scanned=1
    else
        json_files "$args" > "$WORK/files"
        while IFS="$(printf '\t')" read -r file start stop; do
            if [ ! -r "$file" ]; then
                echo "E $file: cannot read"
                continue
            fi
            if [ "$stop" -ge 0 ] 2>/dev/null; then
                tail -c +$((start + 1)) "$file" | head -c $((stop - start))
            else
                tail -c +$((start + 1)) "$file"
            fi | gawk -b -v base="$start" -v FROM="$from" -v TO="$to" \
                -v FILE="$file" -v MATCHES="$matches" -v HISTO="$histo" \
                "$AWK_TS$scan"
            scanned=$((scanned + 1))
        done < "$WORK/files"
    fi

    if [ "$scanned" -eq 0 ]; then
        echo "F no readable log source"
        return
    fi

    # Histogram over the full matched set, bucket counts summed and sorted.
    gawk '{ sum[$1] += $2 } END { for (m in sum) print m, sum[m] }' "$histo" | \
        sort -n | while read -r m c; do
        echo "H $m $c"
    done

    total=$(wc -l < "$matches")

    # Newest max_messages win; stable sort keeps file order inside a second.
    sort -s -n -t "$(printf '\037')" -k1,1 "$matches" | tail -n "$maxm" | \
        while IFS="$(printf '\037')" read -r ts loc line; do
        enc=$(printf '%s' "$line" | base64 | tr -d '\n')
        echo "M ${ts}000000000 $loc $enc"
    done

    echo "T $total"
    rm -rf "$WORK"
    echo "D"
}

handle_ls() {
    for f in /var/log/messages /var/log/syslog; do
        if [ -r "$f" ]; then
            [ -r "$f.1" ] && echo "S $f.1"
            echo "S $f"
            echo "D"
            return
        fi
    done
    if command -v journalctl >/dev/null 2>&1; then
        echo "S journalctl"
        echo "D"
        return
    fi
    echo "F no readable log source found"
}

while IFS= read -r cmdline; do
    case "$cmdline" in
    IDX\ *) handle_idx "${cmdline#IDX }" ;;
    RUN\ *) handle_run "${cmdline#RUN }" ;;
    LS) handle_ls ;;
    *) : ;; # unknown input (including cancel noise) is ignored
    esac
done
"#;
